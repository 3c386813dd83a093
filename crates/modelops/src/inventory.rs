use std::path::{Path, PathBuf};

/// A model directory is valid only if it carries this file.
pub const CONFIG_MARKER: &str = "config.json";

/// Sorted names of the model directories under `root`.
/// Missing or unreadable roots yield an empty list.
pub fn list_available(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return vec![];
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        // lazy validation: the marker must be a regular file
        if !path.join(CONFIG_MARKER).is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
        out.push(name);
    }

    out.sort();
    out
}

/// Registry names are a single path component; anything that could climb
/// out of the root is rejected.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

pub fn resolve_model_dir(root: &Path, name: &str) -> Option<PathBuf> {
    if !is_valid_name(name) {
        return None;
    }
    let dir = root.join(name);
    dir.is_dir().then_some(dir)
}

/// Recursive sum of regular file sizes. `None` if any directory can't be read.
pub fn approx_size(dir: &Path) -> Option<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).ok()? {
            let entry = entry.ok()?;
            let ty = entry.file_type().ok()?;
            if ty.is_dir() {
                stack.push(entry.path());
            } else if ty.is_file() {
                total += entry.metadata().ok()?.len();
            }
        }
    }
    Some(total)
}
