//! # Source Separation
//!
//! Splits a mix into drums, bass, other and vocals by running a Demucs
//! checkpoint through its command-line front end.
//!
//! ## Output Layout:
//! The CLI is invoked with `--filename {stem}.{ext}`, so stems land at
//! `<out>/<model>/<stem>.wav`.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Four-stem checkpoints the separator accepts.
pub const KNOWN_MODELS: &[&str] = &[
    "htdemucs",
    "htdemucs_ft",
    "hdemucs_mmi",
    "mdx",
    "mdx_extra",
    "mdx_q",
    "mdx_extra_q",
];

pub const DEFAULT_MODEL: &str = "htdemucs";

#[derive(Error, Debug)]
pub enum SeparationError {
    #[error("Unknown separation model: {0}")]
    UnknownModel(String),

    #[error("Unknown stem '{0}', expected drums, bass, other or vocals")]
    UnknownStem(String),

    #[error("No stems requested")]
    NoStems,

    #[error("Separation command '{0}' not found")]
    CommandNotFound(String),

    #[error("Separation failed: {0}")]
    Failed(String),

    #[error("Separation I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bundle stems: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// One output track, in the fixed output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stem {
    Drums,
    Bass,
    Other,
    Vocals,
}

impl Stem {
    pub const ALL: [Stem; 4] = [Stem::Drums, Stem::Bass, Stem::Other, Stem::Vocals];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Other => "other",
            Stem::Vocals => "vocals",
        }
    }
}

impl FromStr for Stem {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drums" => Ok(Stem::Drums),
            "bass" => Ok(Stem::Bass),
            "other" => Ok(Stem::Other),
            "vocals" | "voice" => Ok(Stem::Vocals),
            other => Err(SeparationError::UnknownStem(other.to_string())),
        }
    }
}

/// Parse a comma-separated stem list into the fixed order, without duplicates.
pub fn parse_stems(csv: &str) -> Result<Vec<Stem>, SeparationError> {
    let mut stems = csv
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Stem::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    stems.sort();
    stems.dedup();
    if stems.is_empty() {
        return Err(SeparationError::NoStems);
    }
    Ok(stems)
}

/// A separated track on disk.
#[derive(Debug, Clone)]
pub struct StemFile {
    pub stem: Stem,
    pub path: PathBuf,
}

/// A validated separation model ready to run.
#[derive(Debug, Clone)]
pub struct Separator {
    model: String,
    command: PathBuf,
}

impl Separator {
    /// Check that `model` is a known checkpoint and `command` can be executed.
    pub fn load_pretrained(model: &str, command: &str) -> Result<Self, SeparationError> {
        let model = model.trim();
        if !KNOWN_MODELS.contains(&model) {
            return Err(SeparationError::UnknownModel(model.to_string()));
        }
        let command = find_executable(command)
            .ok_or_else(|| SeparationError::CommandNotFound(command.to_string()))?;
        Ok(Self {
            model: model.to_string(),
            command,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Separate `input` into `work_dir`, returning the requested stems in
    /// drums, bass, other, vocals order. Blocks until the process exits.
    pub fn apply(&self, input: &Path, work_dir: &Path, stems: &[Stem]) -> Result<Vec<StemFile>, SeparationError> {
        if stems.is_empty() {
            return Err(SeparationError::NoStems);
        }
        let out_dir = work_dir.join("separated");
        std::fs::create_dir_all(&out_dir)?;

        info!(model = %self.model, input = %input.display(), "Running source separation");
        let started = std::time::Instant::now();

        let output = Command::new(&self.command)
            .arg("-n")
            .arg(&self.model)
            .arg("-o")
            .arg(&out_dir)
            .arg("--filename")
            .arg("{stem}.{ext}")
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
            return Err(SeparationError::Failed(format!("{}: {}", output.status, tail)));
        }
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "Separation output");

        let model_dir = out_dir.join(&self.model);
        let mut files = Vec::with_capacity(stems.len());
        for stem in Stem::ALL.iter().filter(|s| stems.contains(s)) {
            let path = model_dir.join(format!("{}.wav", stem.as_str()));
            if !path.is_file() {
                return Err(SeparationError::Failed(format!(
                    "Expected stem file {} was not produced",
                    path.display()
                )));
            }
            files.push(StemFile { stem: *stem, path });
        }

        info!(
            model = %self.model,
            stems = files.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Source separation finished"
        );
        Ok(files)
    }
}

/// Zip stems as `<prefix>_<stem>.wav` entries.
pub fn bundle(files: &[StemFile], prefix: &str) -> Result<Vec<u8>, SeparationError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    // wav data barely compresses
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for file in files {
        writer.start_file(format!("{prefix}_{}.wav", file.stem.as_str()), options)?;
        writer.write_all(&std::fs::read(&file.path)?)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Resolve a command name through `PATH`, or check an explicit path.
fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stems_orders_and_dedups() {
        let stems = parse_stems("vocals, drums,bass,vocals").unwrap();
        assert_eq!(stems, vec![Stem::Drums, Stem::Bass, Stem::Vocals]);
        assert!(matches!(parse_stems(" , "), Err(SeparationError::NoStems)));
        assert!(matches!(parse_stems("piano"), Err(SeparationError::UnknownStem(_))));
    }

    #[test]
    fn test_load_pretrained_validation() {
        assert!(matches!(
            Separator::load_pretrained("htdemucs_6s", "sh"),
            Err(SeparationError::UnknownModel(_))
        ));
        assert!(matches!(
            Separator::load_pretrained("htdemucs", "/definitely/not/here/demucs"),
            Err(SeparationError::CommandNotFound(_))
        ));
    }

    #[test]
    fn test_bundle_contains_named_entries() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<StemFile> = [Stem::Bass, Stem::Vocals]
            .into_iter()
            .map(|stem| {
                let path = dir.path().join(format!("{}.wav", stem.as_str()));
                std::fs::write(&path, stem.as_str()).unwrap();
                StemFile { stem, path }
            })
            .collect();

        let bytes = bundle(&files, "song").unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("song_vocals.wav").unwrap(), &mut content).unwrap();
        assert_eq!(content, "vocals");
    }

    #[cfg(unix)]
    fn fake_demucs(dir: &Path, exit_code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-demucs");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 model=\"$2\"; out=\"$4\"\n\
                 mkdir -p \"$out/$model\"\n\
                 for s in drums bass other vocals; do echo \"$s\" > \"$out/$model/$s.wav\"; done\n\
                 echo 'separation log' >&2\n\
                 exit {exit_code}\n"
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_returns_requested_stems_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_demucs(dir.path(), 0);
        let separator = Separator::load_pretrained("htdemucs", script.to_str().unwrap()).unwrap();

        let input = dir.path().join("mix.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let files = separator
            .apply(&input, dir.path(), &[Stem::Vocals, Stem::Drums])
            .unwrap();

        let stems: Vec<Stem> = files.iter().map(|f| f.stem).collect();
        assert_eq!(stems, vec![Stem::Drums, Stem::Vocals]);
        assert!(files[1].path.ends_with("separated/htdemucs/vocals.wav"));
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_reports_process_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_demucs(dir.path(), 3);
        let separator = Separator::load_pretrained("mdx", script.to_str().unwrap()).unwrap();

        let input = dir.path().join("mix.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        match separator.apply(&input, dir.path(), &[Stem::Bass]) {
            Err(SeparationError::Failed(message)) => assert!(message.contains("separation log")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
