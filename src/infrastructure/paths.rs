//! Path helpers for configuration and log files.

use std::path::PathBuf;

/// Returns the directory canopy writes its logs to by default.
///
/// Resolves to `$XDG_DATA_HOME/canopy`, falling back to
/// `~/.local/share/canopy`, and to a relative `.canopy` when no home
/// directory is known.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(data_home) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data_home).join("canopy");
    }
    match home_dir() {
        Some(home) => home.join(".local").join("share").join("canopy"),
        None => PathBuf::from(".canopy"),
    }
}

/// Expands a leading `~` to the user's home directory.
///
/// Paths without a leading tilde, and every path when no home directory is
/// known, are returned unchanged.
///
/// # Examples
///
/// ```
/// use canopy::infrastructure::expand_tilde;
///
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// assert_eq!(expand_tilde("relative/~"), "relative/~");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    let Some(home) = home_dir() else {
        return path.to_string();
    };
    if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest).to_string_lossy().into_owned()
    } else if path == "~" {
        home.to_string_lossy().into_owned()
    } else {
        path.to_string()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
