// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File transfer engine: chunked uploads/downloads with progress events.
//!
//! Downloads loop fixed-size device reads through the codec; uploads batch
//! local chunks into multi-statement snippets so one device round-trip
//! carries up to 16 KB of source. Directory forms reuse a single raw-REPL
//! session. The agent is local, so file content moves through the local
//! filesystem directly, never through the UDP envelope.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::device_fs::{normalize_remote_path, py_bytes_literal, py_quote, DeviceFs, DEVICE_CHUNK};
use crate::error::{ErrorKind, ReplError, Result};
use crate::protocol::{ProgressEvent, ProgressStatus};
use crate::repl::{ExecIo, RawRepl};

/// Source-code bytes per upload batch (one device transaction).
pub const PUT_BATCH_BYTES: usize = 16 * 1024;
const RETRY_PAUSE: Duration = Duration::from_millis(200);

pub type ProgressFn<'a> = &'a mut dyn FnMut(ProgressEvent);

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

fn io_err(context: &str, err: &std::io::Error) -> ReplError {
    ReplError::device(format!("{context}: {err}"))
}

/// Whether a failure is worth one more attempt after a short pause.
fn transient(err: &ReplError) -> bool {
    matches!(err.kind, ErrorKind::Timeout | ErrorKind::EnterRawFailed | ErrorKind::RawPasteError)
}

fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) if transient(&e) => {
            debug!(err = %e, "transfer retry after transient error");
            std::thread::sleep(RETRY_PAUSE);
            op()
        }
        Err(e) => Err(e),
    }
}

/// Download one device file to a local path.
///
/// Emits `{current, total, file}` progress per device chunk when a callback
/// is given. Returns the byte count written.
pub fn get_to_local(
    repl: &mut RawRepl,
    core: &str,
    root_fs: &str,
    remote: &str,
    local: &Path,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<u64> {
    let remote = normalize_remote_path(remote, root_fs);
    let total = DeviceFs::new(repl, core, root_fs).stat(&remote)?;

    let local = resolve_local_target(local, &remote);
    if let Some(parent) = local.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| io_err("create local dir", &e))?;
        }
    }
    let mut out =
        std::fs::File::create(&local).map_err(|e| io_err("create local file", &e))?;

    repl.enter_raw(true)?;
    let result = (|| -> Result<u64> {
        repl.exec(
            format!("import sys\nf = open({}, 'rb')\n", py_quote(&remote)).as_bytes(),
            &mut ExecIo::default(),
        )?;

        let name = file_name(&remote);
        let mut read_total: u64 = 0;
        while read_total < total {
            let want = DEVICE_CHUNK.min((total - read_total) as usize);
            let chunk = repl.exec(
                format!(
                    "chunk = f.read({want})\nif chunk:\n    sys.stdout.buffer.write(chunk)\n"
                )
                .as_bytes(),
                &mut ExecIo::default(),
            )?;
            if chunk.is_empty() {
                break;
            }
            out.write_all(&chunk).map_err(|e| io_err("write local file", &e))?;
            read_total += chunk.len() as u64;
            if let Some(cb) = progress.as_mut() {
                cb(ProgressEvent {
                    current: read_total,
                    total,
                    file: Some(name.clone()),
                    bytes: Some(read_total),
                    status: None,
                });
            }
        }
        repl.exec(b"f.close()", &mut ExecIo::default())?;
        Ok(read_total)
    })();
    let leave = repl.exit_raw();

    let read_total = result?;
    leave?;
    if read_total != total {
        return Err(ReplError::device(format!(
            "download incomplete: got {read_total}/{total} bytes"
        )));
    }
    Ok(read_total)
}

/// Download a remote directory tree.
///
/// Walks the remote tree, computes a file plan, then emits one
/// `{current, total, file, status}` stream per file transition.
pub fn getdir_to_local(
    repl: &mut RawRepl,
    core: &str,
    root_fs: &str,
    remote_dir: &str,
    local_dir: &Path,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<u64> {
    let remote_dir = normalize_remote_path(remote_dir, root_fs);
    let plan: Vec<(String, u64)> = DeviceFs::new(repl, core, root_fs)
        .ls_recursive(&remote_dir)?
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| (e.name, e.size))
        .collect();

    let total = plan.len() as u64;
    let mut copied_bytes = 0u64;
    for (index, (remote_path, _size)) in plan.iter().enumerate() {
        let rel = remote_path
            .strip_prefix(&remote_dir)
            .unwrap_or(remote_path)
            .trim_start_matches('/');
        let target = local_dir.join(rel);
        let name = file_name(remote_path);

        if let Some(cb) = progress.as_mut() {
            cb(ProgressEvent {
                current: index as u64,
                total,
                file: Some(name.clone()),
                bytes: None,
                status: Some(ProgressStatus::Starting),
            });
        }
        let copied = with_retry(|| {
            get_to_local(repl, core, root_fs, remote_path, &target, None)
        })?;
        copied_bytes += copied;
        if let Some(cb) = progress.as_mut() {
            cb(ProgressEvent {
                current: index as u64 + 1,
                total,
                file: Some(name),
                bytes: Some(copied_bytes),
                status: Some(ProgressStatus::Done),
            });
        }
    }
    Ok(copied_bytes)
}

/// Upload a local file to the device.
///
/// Local 4 KB chunks are batched into `;`-joined `f.write(b'...')`
/// statements up to [`PUT_BATCH_BYTES`] of source per device transaction.
/// Streaming callers get `{current, total, bytes, file}` per chunk.
pub fn put_from_local(
    repl: &mut RawRepl,
    core: &str,
    root_fs: &str,
    local: &Path,
    remote: &str,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<u64> {
    let remote = normalize_remote_path(remote, root_fs);

    for attempt in 0..2u8 {
        repl.enter_raw(true)?;
        let open_result = repl.exec(
            format!("f = open({}, 'wb')\n", py_quote(&remote)).as_bytes(),
            &mut ExecIo::default(),
        );
        match open_result {
            Ok(_) => {}
            Err(e) if attempt == 0
                && e.kind == ErrorKind::DeviceError
                && e.detail.contains("EEXIST") =>
            {
                // Some ports refuse to truncate in place; remove and retry.
                let _ = repl.exit_raw();
                DeviceFs::new(repl, core, root_fs).rm(&remote)?;
                continue;
            }
            Err(e) => {
                let _ = repl.exit_raw();
                return Err(e);
            }
        }

        let progress_ref: Option<&mut dyn FnMut(ProgressEvent)> = match progress.as_mut() {
            Some(p) => Some(&mut **p),
            None => None,
        };
        let result = put_body(repl, local, &remote, progress_ref);
        let leave = repl.exit_raw();
        let sent = result?;
        leave?;
        return Ok(sent);
    }
    Err(ReplError::device(format!("could not open {remote} for writing")))
}

/// Shared upload loop; assumes the remote file is open as `f` in an active
/// raw session.
fn put_body(
    repl: &mut RawRepl,
    local: &Path,
    remote: &str,
    mut progress: Option<&mut dyn FnMut(ProgressEvent)>,
) -> Result<u64> {
    let mut input = std::fs::File::open(local).map_err(|e| io_err("open local file", &e))?;
    let total = input.metadata().map_err(|e| io_err("stat local file", &e))?.len();
    let name = file_name(remote);

    let mut batch: Vec<String> = Vec::new();
    let mut batch_bytes = 0usize;
    let mut sent = 0u64;
    let mut buf = vec![0u8; DEVICE_CHUNK];

    loop {
        let n = input.read(&mut buf).map_err(|e| io_err("read local file", &e))?;
        if n == 0 {
            if !batch.is_empty() {
                repl.exec(batch.join(";\n").as_bytes(), &mut ExecIo::default())?;
            }
            break;
        }
        let line = format!("f.write({})", py_bytes_literal(&buf[..n]));
        batch_bytes += line.len();
        batch.push(line);
        sent += n as u64;

        if batch_bytes >= PUT_BATCH_BYTES {
            repl.exec(batch.join(";\n").as_bytes(), &mut ExecIo::default())?;
            batch.clear();
            batch_bytes = 0;
        }

        if let Some(cb) = progress.as_mut() {
            cb(ProgressEvent {
                current: sent,
                total,
                file: Some(name.clone()),
                bytes: Some(sent),
                status: None,
            });
        }
    }

    repl.exec(b"f.close()", &mut ExecIo::default())?;
    Ok(sent)
}

/// Upload a local directory tree in one raw-REPL session.
///
/// Enters raw once, creates remote directories in walk order (ignoring
/// `EEXIST`), uploads files with chunk batching, and leaves raw once.
pub fn putdir_from_local(
    repl: &mut RawRepl,
    _core: &str,
    root_fs: &str,
    local_dir: &Path,
    remote_dir: &str,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<u64> {
    let remote_dir = normalize_remote_path(remote_dir, root_fs);
    let plan = walk_local(local_dir, &remote_dir)?;
    let total = plan.files.len() as u64;

    repl.enter_raw(true)?;
    let result = (|| -> Result<u64> {
        for dir in &plan.dirs {
            let code = format!(
                r#"import os
try:
    os.mkdir({})
except OSError:
    pass
"#,
                py_quote(dir)
            );
            repl.exec(code.as_bytes(), &mut ExecIo::default())?;
        }

        let mut uploaded_bytes = 0u64;
        for (index, (local_path, remote_path)) in plan.files.iter().enumerate() {
            if let Some(cb) = progress.as_mut() {
                cb(ProgressEvent {
                    current: index as u64,
                    total,
                    file: Some(file_name(remote_path)),
                    bytes: Some(uploaded_bytes),
                    status: Some(ProgressStatus::Starting),
                });
            }
            repl.exec(
                format!("f = open({}, 'wb')\n", py_quote(remote_path)).as_bytes(),
                &mut ExecIo::default(),
            )?;
            uploaded_bytes += put_body(repl, local_path, remote_path, None)?;
            if let Some(cb) = progress.as_mut() {
                cb(ProgressEvent {
                    current: index as u64 + 1,
                    total,
                    file: Some(file_name(remote_path)),
                    bytes: Some(uploaded_bytes),
                    status: Some(ProgressStatus::Done),
                });
            }
        }
        Ok(uploaded_bytes)
    })();
    let leave = repl.exit_raw();
    let uploaded = result?;
    leave?;
    Ok(uploaded)
}

struct UploadPlan {
    /// Remote directories in creation order (parents first).
    dirs: Vec<String>,
    /// `(local, remote)` file pairs.
    files: Vec<(PathBuf, String)>,
}

fn walk_local(local_dir: &Path, remote_dir: &str) -> Result<UploadPlan> {
    let mut plan = UploadPlan { dirs: vec![remote_dir.to_owned()], files: Vec::new() };
    walk_local_into(local_dir, remote_dir, &mut plan)?;
    Ok(plan)
}

fn walk_local_into(dir: &Path, remote: &str, plan: &mut UploadPlan) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| io_err("read local dir", &e))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| io_err("read local dir", &e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let remote_child = format!("{}/{}", remote.trim_end_matches('/'), name);
        let file_type = entry.file_type().map_err(|e| io_err("stat local entry", &e))?;
        if file_type.is_dir() {
            plan.dirs.push(remote_child.clone());
            walk_local_into(&entry.path(), &remote_child, plan)?;
        } else if file_type.is_file() {
            plan.files.push((entry.path(), remote_child));
        }
    }
    Ok(())
}

fn resolve_local_target(local: &Path, remote: &str) -> PathBuf {
    if local.is_dir() {
        local.join(file_name(remote))
    } else {
        local.to_path_buf()
    }
}

#[cfg(test)]
#[path = "transfer_tests.rs"]
mod tests;
