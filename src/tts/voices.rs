//! Voice catalog
//!
//! Enumerates voice IDs from a voice pack. Three container formats are
//! recognized by extension: `.bin` (zip archive of `<voice_id>.npy` style
//! embeddings, the v1.0 bundle layout), `.npz` (named-array archive, also a
//! zip underneath), and `.json` (object keyed by voice ID, or an array of
//! IDs). The engine memoizes the result for the process lifetime.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use tracing::debug;

use crate::error::SpeechError;

/// Read the sorted, deduplicated voice IDs from a voice pack file.
pub fn load_voice_ids(path: &Path) -> Result<Vec<String>, SpeechError> {
    if !path.exists() {
        return Err(SpeechError::TtsNotReady(format!(
            "voices file not found: {}",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let voices = match extension.as_str() {
        "bin" | "npz" => archive_voice_ids(path)?,
        "json" => json_voice_ids(path)?,
        _ => {
            return Err(SpeechError::VoicePackInvalid {
                path: path.to_path_buf(),
            })
        }
    };

    debug!("Voice pack {} lists {} voices", path.display(), voices.len());
    Ok(voices)
}

/// Entry names of a zip-based pack, with the `.npy` suffix stripped.
fn archive_voice_ids(path: &Path) -> Result<Vec<String>, SpeechError> {
    let file = File::open(path).map_err(|_| SpeechError::VoicePackInvalid {
        path: path.to_path_buf(),
    })?;
    let archive = zip::ZipArchive::new(file).map_err(|_| SpeechError::VoicePackInvalid {
        path: path.to_path_buf(),
    })?;

    let mut ids = BTreeSet::new();
    for name in archive.file_names() {
        if let Some(id) = name.strip_suffix(".npy") {
            if !id.is_empty() {
                ids.insert(id.to_string());
            }
        }
    }
    Ok(ids.into_iter().collect())
}

fn json_voice_ids(path: &Path) -> Result<Vec<String>, SpeechError> {
    let file = File::open(path).map_err(|_| SpeechError::VoicePackInvalid {
        path: path.to_path_buf(),
    })?;
    let value: serde_json::Value =
        serde_json::from_reader(file).map_err(|_| SpeechError::VoicePackInvalid {
            path: path.to_path_buf(),
        })?;

    let mut ids = BTreeSet::new();
    match value {
        serde_json::Value::Object(map) => {
            ids.extend(map.keys().cloned());
        }
        serde_json::Value::Array(items) => {
            for item in items {
                if let serde_json::Value::String(s) = item {
                    ids.insert(s);
                }
            }
        }
        _ => {
            return Err(SpeechError::VoicePackInvalid {
                path: path.to_path_buf(),
            })
        }
    }
    Ok(ids.into_iter().collect())
}
