//! # Checkpoint files
//!
//! Reads every named tensor of a checkpoint into memory and writes the
//! partitioned safetensors files produced by [`crate::Models::save`].
use crate::error::LoadError;
use std::io::Read;
use std::path::Path;
use tch::{Device, Tensor};

/// On-disk formats understood by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    SafeTensors,
    /// Tensor archives written by libtorch (`.ot`, `.pt`, `.bin`).
    Torch,
    Npz,
}

impl CheckpointFormat {
    /// Picks a format from the file extension, falling back to the leading
    /// bytes of the file for unknown extensions.
    pub fn detect(path: &Path, header: &[u8]) -> Result<Self, LoadError> {
        let extension = path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("safetensors") => Ok(Self::SafeTensors),
            Some("ot") | Some("pt") | Some("bin") => Ok(Self::Torch),
            Some("npz") => Ok(Self::Npz),
            Some("ckpt") => Err(LoadError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: "pickled checkpoints cannot be read, convert it to .safetensors first"
                    .to_string(),
            }),
            _ if looks_like_safetensors(header) => Ok(Self::SafeTensors),
            _ => Ok(Self::Torch),
        }
    }
}

// A safetensors file starts with the little-endian length of its json header.
fn looks_like_safetensors(header: &[u8]) -> bool {
    header.len() >= 9 && header[8] == b'{'
}

/// Reads all the tensors of a checkpoint on the CPU.
///
/// The file is opened up-front so that a missing or unreadable file is
/// reported as [`LoadError::Io`], it is closed again before returning.
pub fn read<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tensor)>, LoadError> {
    let path = path.as_ref();
    let header = {
        let mut file = crate::utils::file_open(path)?;
        let mut header = Vec::with_capacity(9);
        file.by_ref()
            .take(9)
            .read_to_end(&mut header)
            .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
        header
    };
    let format = CheckpointFormat::detect(path, &header)?;
    log::info!("reading {format:?} checkpoint {path:?}");
    let tensors = match format {
        CheckpointFormat::SafeTensors => Tensor::read_safetensors(path),
        CheckpointFormat::Torch => Tensor::load_multi_with_device(path, Device::Cpu),
        CheckpointFormat::Npz => Tensor::read_npz(path),
    };
    let tensors =
        tensors.map_err(|source| LoadError::Checkpoint { path: path.to_path_buf(), source })?;
    log::debug!("read {} tensors from {path:?}", tensors.len());
    Ok(tensors)
}

/// Writes named tensors to a safetensors file, moving them to the CPU first.
pub fn write_safetensors<P: AsRef<Path>>(
    path: P,
    tensors: &[(String, Tensor)],
) -> Result<(), LoadError> {
    let path = path.as_ref();
    let tensors: Vec<(&str, Tensor)> = tensors
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.to_device(Device::Cpu).contiguous()))
        .collect();
    Tensor::write_safetensors(tensors.as_slice(), path)
        .map_err(|source| LoadError::Checkpoint { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn format_from_extension() {
        let detect = |p: &str| CheckpointFormat::detect(&PathBuf::from(p), &[]);
        assert_eq!(detect("v1-5.safetensors").unwrap(), CheckpointFormat::SafeTensors);
        assert_eq!(detect("unet.ot").unwrap(), CheckpointFormat::Torch);
        assert_eq!(detect("vae.NPZ").unwrap(), CheckpointFormat::Npz);
        assert!(matches!(detect("v1-5.ckpt"), Err(LoadError::UnsupportedFormat { .. })));
    }

    #[test]
    fn format_from_header() {
        let mut header = 42u64.to_le_bytes().to_vec();
        header.push(b'{');
        let path = PathBuf::from("weights");
        assert_eq!(
            CheckpointFormat::detect(&path, &header).unwrap(),
            CheckpointFormat::SafeTensors
        );
        assert_eq!(CheckpointFormat::detect(&path, b"PK\x03\x04").unwrap(), CheckpointFormat::Torch);
    }

    #[test]
    fn missing_file_is_io() {
        let err = read("/nonexistent/checkpoint.safetensors").unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
