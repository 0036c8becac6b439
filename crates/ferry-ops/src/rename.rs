//! Rename execution and filename validation.

use std::path::Path;

use ferry_core::FsError;

use crate::adapter::FileSystemAdapter;
use crate::job::JobOutcome;
use crate::operation::sibling;
use crate::progress::ProgressReporter;

/// Rename `source` to `new_name` within its parent directory.
pub(crate) fn run_rename(
    adapter: &dyn FileSystemAdapter,
    source: &Path,
    new_name: &str,
    overwrite: bool,
    reporter: &mut ProgressReporter,
) -> Result<JobOutcome, FsError> {
    let destination = sibling(source, new_name);
    reporter.begin(1, 0);
    reporter.set_current(source);

    let result_path = if destination == source {
        if !adapter.exists(source) {
            return Err(FsError::NotFound {
                path: source.to_path_buf(),
            });
        }
        destination
    } else if overwrite {
        adapter.move_entry(source, &destination, true)?
    } else {
        adapter.rename(source, new_name)?
    };

    reporter.file_done(0);
    Ok(JobOutcome::with_result(result_path, 1, 0))
}

/// Validate a filename for cross-platform compatibility.
pub fn validate_filename(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }

    if name.len() > 255 {
        return Err("Name is too long (max 255 bytes)".into());
    }

    for c in ['/', '\0'] {
        if name.contains(c) {
            return Err(format!("Name cannot contain '{}'", c.escape_default()));
        }
    }

    #[cfg(target_os = "windows")]
    {
        let windows_invalid = ['\\', ':', '*', '?', '"', '<', '>', '|'];
        for c in windows_invalid {
            if name.contains(c) {
                return Err(format!("Name cannot contain '{}'", c));
            }
        }

        let reserved = [
            "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
            "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
        ];
        let upper_name = name.to_uppercase();
        let base_name = upper_name.split('.').next().unwrap_or("");
        if reserved.contains(&base_name) {
            return Err("Reserved filename".into());
        }
    }

    if name == "." || name == ".." {
        return Err("'.' and '..' are reserved names".into());
    }

    if name.starts_with(' ') || name.ends_with(' ') {
        return Err("Name cannot start or end with spaces".into());
    }

    if name.ends_with('.') {
        return Err("Name cannot end with a dot".into());
    }

    Ok(())
}
