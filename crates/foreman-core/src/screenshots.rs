use std::path::{Path, PathBuf};

/// Directories scanned for UI screenshots after a cosmetic-typed job.
const SCREENSHOT_DIRS: [&str; 2] = ["test-results", "playwright-report"];
const SCREENSHOT_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const MAX_SCREENSHOTS: usize = 20;

/// Collect screenshot paths from the worktree's test artifact directories.
/// Symbolic links are skipped; at most 20 paths are returned.
pub fn collect_screenshots(worktree: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in SCREENSHOT_DIRS {
        let root = Path::new(worktree).join(dir);
        walk(&root, &mut found);
        if found.len() >= MAX_SCREENSHOTS {
            break;
        }
    }
    found.truncate(MAX_SCREENSHOTS);
    found
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) {
    if found.len() >= MAX_SCREENSHOTS {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if found.len() >= MAX_SCREENSHOTS {
            return;
        }
        let path = entry.path();
        // lstat so symlinked files and directories are both refused.
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            walk(&path, found);
        } else if has_screenshot_extension(&path) {
            found.push(path);
        }
    }
}

fn has_screenshot_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            SCREENSHOT_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}
