use std::path::{Path, PathBuf};

/// Resolve the formsync home directory.
///
/// Priority:
/// 1) FORMSYNC_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.formsync
pub fn formsync_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("FORMSYNC_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".formsync");
    }
    PathBuf::from(".").join(".formsync")
}

/// Make an identifier safe to use as a file name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Atomic write via temp file + rename. Readers see the old or the new
/// content, never a partial file.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let temp_path = parent.join(format!(".tmp_{}", uuid::Uuid::new_v4()));
    std::fs::write(&temp_path, content)?;
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}
