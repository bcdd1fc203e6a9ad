//! Thumbnail generation by spawning the external image converter.
//!
//! The converter (ImageMagick `convert` by default) reads the source file
//! and writes the encoded thumbnail to stdout, which is redirected into a
//! uniquely named temp file in the target's own shard directory. Only a
//! fully written temp file is renamed to the final path, so a reader that
//! stats the cache path never sees a partial artifact.

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::cache::ThumbInfo;
use crate::descriptor::Mode;
use crate::error::{Error, Result};

/// Run the converter for `ti`, staging output in `dir` (the shard directory,
/// guaranteed to be on the same filesystem as the final path).
pub(crate) fn generate(ti: &ThumbInfo, dir: &Path) -> Result<()> {
    let temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| Error::io(format!("create temp file in {}", dir.display()), &e))?;
    let stdout = temp
        .as_file()
        .try_clone()
        .map_err(|e| Error::io("clone temp file handle", &e))?;

    let args = convert_args(ti);
    debug!(program = ti.program(), ?args, "spawning converter");
    let child = Command::new(ti.program())
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::GenerationFailed(format!("failed to run {}: {e}", ti.program())))?;

    let output = child
        .wait_with_output()
        .map_err(|e| Error::GenerationFailed(format!("failed to wait for {}: {e}", ti.program())))?;
    if !output.status.success() {
        // Temp file is dropped (and unlinked) on return.
        let diagnostics = String::from_utf8_lossy(&output.stderr);
        return Err(Error::GenerationFailed(diagnostics.trim().to_string()));
    }

    temp.persist(ti.path())
        .map_err(|e| Error::io(format!("rename into {}", ti.path().display()), &e.error))?;
    Ok(())
}

/// ImageMagick argument vector for one descriptor. Deterministic per
/// descriptor; the output specifier `<format>:-` sends encoded bytes to stdout.
fn convert_args(ti: &ThumbInfo) -> Vec<String> {
    let size = ti.dimensions().to_string();
    let mut args = vec![ti.source().display().to_string()];
    match ti.mode() {
        // Fill the frame: scale to cover, then crop the centered overflow.
        Mode::Crop => args.extend([
            "-resize".to_string(),
            format!("{size}^"),
            "-gravity".to_string(),
            "center".to_string(),
            "-extent".to_string(),
            size,
        ]),
        Mode::Shrink => args.extend(["-resize".to_string(), size]),
        // `!` forces exact geometry, ignoring aspect ratio.
        Mode::Stretch => args.extend(["-resize".to_string(), format!("{size}!")]),
    }
    args.push(format!("{}:-", ti.format().ext()));
    args
}
