//! Long operations the engine host ships with.
//!
//! - `HashFile`: BLAKE3 digest of one file, progress per chunk
//! - `DirectorySize`: file count and total size of a directory tree

use std::io::Read;
use std::path::PathBuf;

use blake3::Hasher as Blake3Hasher;
use hearth_core::ipc::{StreamReader, StreamWriter};
use hearth_core::{HearthError, LongOpWorker, Progress, Result, WorkerRegistry};
use tracing::debug;
use uuid::Uuid;

/// Chunk size for reading files (1MB keeps cancellation responsive).
const CHUNK_SIZE: usize = 1024 * 1024;

pub const HASH_FILE: &str = "HashFile";
pub const DIRECTORY_SIZE: &str = "DirectorySize";

/// Registry with every built-in worker.
pub fn builtin_registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .with(HASH_FILE, HashFileWorker::default)
        .with(DIRECTORY_SIZE, DirectorySizeWorker::default)
}

fn read_path(config: &mut StreamReader) -> Result<PathBuf> {
    let path = PathBuf::from(config.read_string()?);
    if path.as_os_str().is_empty() {
        return Err(HearthError::Config {
            message: "empty path".to_string(),
        });
    }
    Ok(path)
}

fn io_error(e: std::io::Error, path: &std::path::Path) -> HearthError {
    HearthError::Io {
        message: format!("{}: {}", path.display(), e),
        source: Some(e),
    }
}

/// Config: `str path`. Result: `str blake3 hex`, `u64 bytes hashed`.
#[derive(Debug, Default)]
pub struct HashFileWorker {
    path: PathBuf,
    total_bytes: u64,
}

impl LongOpWorker for HashFileWorker {
    fn initialize_execution(&mut self, config: &mut StreamReader, _document: Uuid) -> Result<()> {
        self.path = read_path(config)?;
        let metadata = std::fs::metadata(&self.path).map_err(|e| io_error(e, &self.path))?;
        if !metadata.is_file() {
            return Err(HearthError::Config {
                message: format!("{} is not a file", self.path.display()),
            });
        }
        self.total_bytes = metadata.len();
        Ok(())
    }

    fn execute(&mut self, progress: &Progress, result: &mut StreamWriter) -> Result<()> {
        let mut file = std::fs::File::open(&self.path).map_err(|e| io_error(e, &self.path))?;
        let mut hasher = Blake3Hasher::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut bytes_processed: u64 = 0;

        loop {
            progress.check_canceled()?;
            let bytes_read = file
                .read(&mut buffer)
                .map_err(|e| io_error(e, &self.path))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            bytes_processed += bytes_read as u64;

            if self.total_bytes > 0 {
                progress.set_completion(bytes_processed as f32 / self.total_bytes as f32);
            }
        }
        progress.set_completion(1.0);

        let digest = hex::encode(hasher.finalize().as_bytes());
        debug!("Hashed {} ({} bytes): {}", self.path.display(), bytes_processed, digest);
        result.write_str(&digest);
        result.write_u64(bytes_processed);
        Ok(())
    }
}

/// Config: `str path`. Result: `u64 file count`, `u64 total bytes`.
#[derive(Debug, Default)]
pub struct DirectorySizeWorker {
    root: PathBuf,
}

impl LongOpWorker for DirectorySizeWorker {
    fn initialize_execution(&mut self, config: &mut StreamReader, _document: Uuid) -> Result<()> {
        self.root = read_path(config)?;
        if !self.root.is_dir() {
            return Err(HearthError::Config {
                message: format!("{} is not a directory", self.root.display()),
            });
        }
        Ok(())
    }

    fn execute(&mut self, progress: &Progress, result: &mut StreamWriter) -> Result<()> {
        // First pass lists the files so the second can report real progress.
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).follow_links(false) {
            progress.check_canceled()?;
            let entry = entry.map_err(|e| HearthError::Io {
                message: e.to_string(),
                source: e.into_io_error(),
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        let mut total_bytes: u64 = 0;
        for (index, path) in files.iter().enumerate() {
            progress.check_canceled()?;
            // Files removed since the listing are skipped.
            if let Ok(metadata) = std::fs::metadata(path) {
                total_bytes += metadata.len();
            }
            progress.set_completion((index + 1) as f32 / files.len() as f32);
        }
        progress.set_completion(1.0);

        debug!(
            "{}: {} files, {} bytes",
            self.root.display(),
            files.len(),
            total_bytes
        );
        result.write_u64(files.len() as u64);
        result.write_u64(total_bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config_for(path: &std::path::Path) -> StreamReader {
        let mut writer = StreamWriter::new();
        writer.write_str(&path.to_string_lossy());
        StreamReader::new(writer.into_bytes())
    }

    fn run(worker: &mut dyn LongOpWorker, path: &std::path::Path) -> Result<StreamReader> {
        worker.initialize_execution(&mut config_for(path), Uuid::nil())?;
        let mut writer = StreamWriter::new();
        worker.execute(&Progress::new(), &mut writer)?;
        Ok(StreamReader::new(writer.into_bytes()))
    }

    #[test]
    fn test_hash_file_matches_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.bin");
        let content = vec![7u8; CHUNK_SIZE * 2 + 13];
        std::fs::write(&path, &content).unwrap();

        let mut reader = run(&mut HashFileWorker::default(), &path).unwrap();
        assert_eq!(
            reader.read_string().unwrap(),
            blake3::hash(&content).to_hex().to_string()
        );
        assert_eq!(reader.read_u64().unwrap(), content.len() as u64);
    }

    #[test]
    fn test_hash_file_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HashFileWorker::default()
            .initialize_execution(&mut config_for(&dir.path().join("missing")), Uuid::nil())
            .unwrap_err();
        assert!(matches!(err, HearthError::Io { .. }));
    }

    #[test]
    fn test_hash_file_stops_when_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.bin");
        std::fs::write(&path, b"content").unwrap();

        let mut worker = HashFileWorker::default();
        worker
            .initialize_execution(&mut config_for(&path), Uuid::nil())
            .unwrap();
        let progress = Progress::new();
        progress.user_clicked_cancel();
        let err = worker
            .execute(&progress, &mut StreamWriter::new())
            .unwrap_err();
        assert!(matches!(err, HearthError::Cancelled));
    }

    #[test]
    fn test_directory_size_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("textures")).unwrap();
        std::fs::write(dir.path().join("scene.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("textures/albedo.png"), [0u8; 100]).unwrap();

        let mut reader = run(&mut DirectorySizeWorker::default(), dir.path()).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 2);
        assert_eq!(reader.read_u64().unwrap(), 102);
    }

    #[test]
    fn test_directory_size_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"x").unwrap();
        let err = DirectorySizeWorker::default()
            .initialize_execution(&mut config_for(&path), Uuid::nil())
            .unwrap_err();
        assert!(matches!(err, HearthError::Config { .. }));
    }

    #[test]
    fn test_empty_config_is_rejected() {
        let mut reader = StreamReader::new(Bytes::new());
        assert!(HashFileWorker::default()
            .initialize_execution(&mut reader, Uuid::nil())
            .is_err());
    }

    #[test]
    fn test_builtin_registry_names() {
        assert_eq!(
            builtin_registry().type_names(),
            vec![DIRECTORY_SIZE.to_string(), HASH_FILE.to_string()]
        );
    }
}
