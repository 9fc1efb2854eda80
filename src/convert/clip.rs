//! CLIP names under `cond_stage_model.transformer.`.
//!
//! Depending on the version of `transformers` used to write the checkpoint the
//! `text_model.` level may be missing.

/// Returns `None` for the `position_ids` buffer, which is not a parameter.
pub fn rename(name: &str) -> Option<String> {
    if name.ends_with("position_ids") {
        return None;
    }
    if name.starts_with("text_model.") {
        Some(name.to_string())
    } else {
        Some(format!("text_model.{name}"))
    }
}
