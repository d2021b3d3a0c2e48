//! Checkpoint command implementation.

use couchtail_engine::{read_checkpoint_file, CheckpointStore, FileCheckpointStore, TailerConfig};
use couchtail_protocol::Checkpoint;
use std::path::PathBuf;

fn resolve(path: Option<PathBuf>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let config = TailerConfig {
        checkpoint_path: path,
        ..TailerConfig::default()
    };
    let home = std::env::var_os("HOME").map(PathBuf::from);
    Ok(config.resolve_checkpoint_path(home.as_deref())?)
}

/// Prints the persisted checkpoint. Works while a tailer holds the lock.
pub fn show(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = resolve(path)?;
    let checkpoint = read_checkpoint_file(&path)?;
    println!("{checkpoint}");
    Ok(())
}

/// Overwrites the persisted checkpoint.
///
/// Takes the checkpoint lock, so it fails while a tailer is running on the
/// same location.
pub fn set(path: Option<PathBuf>, seq: &str) -> Result<(), Box<dyn std::error::Error>> {
    let checkpoint =
        Checkpoint::parse(seq).ok_or_else(|| format!("invalid checkpoint value {seq:?}"))?;
    let path = resolve(path)?;
    let store = FileCheckpointStore::open(&path)?;
    let previous = store.read()?;
    store.write(&checkpoint)?;

    tracing::info!(path = %path.display(), %previous, %checkpoint, "checkpoint updated");
    println!("{previous} -> {checkpoint}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_then_show() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seq");

        set(Some(path.clone()), "25").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "25");
        show(Some(path)).unwrap();
    }

    #[test]
    fn set_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seq");
        assert!(set(Some(path.clone()), "two words").is_err());
        assert!(set(Some(path.clone()), "").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn set_refused_while_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seq");
        let _running = FileCheckpointStore::open(&path).unwrap();
        assert!(set(Some(path), "3").is_err());
    }
}
