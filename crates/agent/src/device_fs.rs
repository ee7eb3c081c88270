// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! High-level device filesystem operations.
//!
//! Each operation is a small Python snippet executed through the raw-REPL
//! codec; outputs are parsed from plain or JSON stdout. Paths are normalized
//! to absolute POSIX form and rewritten under the connection's root
//! filesystem prefix when it is not `/`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::board;
use crate::error::{ReplError, Result};
use crate::repl::RawRepl;

pub const DEVICE_CHUNK: usize = 4096;

/// One `ls` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemInfo {
    pub free: u64,
    pub alloc: u64,
    pub total: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatResult {
    pub content: String,
    pub is_binary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOutcome {
    pub formatted: bool,
    /// The caller must drop and re-establish the connection afterwards.
    pub reconnect: bool,
}

/// Quote a device path for embedding in a single-quoted Python literal.
pub fn py_quote(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    out.push('\'');
    for c in path.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render a byte slice as a Python bytes literal (`b'...'`).
pub fn py_bytes_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            other => out.push_str(&format!("\\x{other:02x}")),
        }
    }
    out.push('\'');
    out
}

/// Normalize a remote path to absolute POSIX form under `root_fs`.
pub fn normalize_remote_path(path: &str, root_fs: &str) -> String {
    let mut p = path.replace('\\', "/");
    if !p.starts_with('/') {
        p.insert(0, '/');
    }
    if root_fs == "/" || p.starts_with(root_fs) {
        return p;
    }
    let trimmed = p.trim_start_matches('/');
    format!("{}/{}", root_fs.trim_end_matches('/'), trimmed)
}

/// Device filesystem bound to one codec and one board identity.
pub struct DeviceFs<'a> {
    repl: &'a mut RawRepl,
    core: String,
    root_fs: String,
}

impl<'a> DeviceFs<'a> {
    pub fn new(repl: &'a mut RawRepl, core: &str, root_fs: &str) -> Self {
        Self { repl, core: core.to_owned(), root_fs: root_fs.to_owned() }
    }

    fn path(&self, path: &str) -> String {
        normalize_remote_path(path, &self.root_fs)
    }

    fn exec_text(&mut self, code: &str) -> Result<String> {
        let out = self.repl.exec_snippet(code)?;
        Ok(String::from_utf8_lossy(&out).trim().to_owned())
    }

    /// Detailed listing: `(name, size, is_dir)` per item, directories first,
    /// case-insensitive name order.
    pub fn ls(&mut self, dir: &str) -> Result<Vec<LsEntry>> {
        let dir = self.path(dir);
        let code = ls_snippet(&dir);
        match self.exec_text(&code) {
            Ok(out) => match parse_ls_json(&out) {
                Ok(entries) => Ok(entries),
                Err(_) => self.ls_fallback(&dir),
            },
            // A traceback here usually means the port lacks the fast path;
            // probe entry by entry instead.
            Err(e) if e.kind == crate::error::ErrorKind::DeviceError => self.ls_fallback(&dir),
            Err(e) => Err(e),
        }
    }

    /// Fallback listing for ports where the JSON fast path fails: plain
    /// listdir, then per-entry probes.
    fn ls_fallback(&mut self, dir: &str) -> Result<Vec<LsEntry>> {
        let code = format!(
            "import os\nprint('\\n'.join(sorted(os.listdir({}))))",
            py_quote(dir)
        );
        let out = self.exec_text(&code)?;
        let names: Vec<String> =
            out.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let full = if dir.ends_with('/') {
                format!("{dir}{name}")
            } else {
                format!("{dir}/{name}")
            };
            let is_dir = self.is_dir(&full)?;
            let size = if is_dir { 0 } else { self.stat(&full)? };
            entries.push(LsEntry { name, size, is_dir });
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    /// Recursive listing with absolute paths.
    pub fn ls_recursive(&mut self, dir: &str) -> Result<Vec<LsEntry>> {
        let dir = self.path(dir);
        let code = format!(
            r#"import os
import json
def walk(path, out):
    try:
        names = os.listdir(path)
    except OSError:
        return
    for name in names:
        full = path + ('/' + name if path != '/' else name)
        try:
            st = os.stat(full)
            d = st[0] & 0x4000 != 0
            out.append([full, 0 if d else st[6], d])
        except OSError:
            out.append([full, 0, False])
            continue
        if d:
            walk(full, out)
items = []
walk({path}, items)
print(json.dumps(items))
"#,
            path = py_quote(&dir)
        );
        let out = self.exec_text(&code)?;
        let mut entries = parse_ls_json(&out)?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    /// File size; 0 for missing files (mirrors the device-side probe).
    pub fn stat(&mut self, path: &str) -> Result<u64> {
        let path = self.path(path);
        let code = if board::is_std_micropython(&self.core) {
            format!(
                r#"import os
try:
    st = os.stat({path})
    print(st[6])
except OSError:
    print(0)
"#,
                path = py_quote(&path)
            )
        } else {
            // No os.stat on this port: open and seek to the end.
            format!(
                r#"try:
    f = open({path}, 'rb')
    f.seek(0, 2)
    print(f.tell())
    f.close()
except OSError:
    print(0)
"#,
                path = py_quote(&path)
            )
        };
        let out = self.exec_text(&code)?;
        out.parse::<u64>()
            .map_err(|_| ReplError::device(format!("unexpected stat output: {out:?}")))
    }

    pub fn is_dir(&mut self, path: &str) -> Result<bool> {
        let path = self.path(path);
        let code = format!(
            r#"vstat = None
try:
    from os import stat
except ImportError:
    from os import listdir
    vstat = listdir
def ls_dir(path):
    if vstat is None:
        try:
            return stat(path)[0] & 0x4000 != 0
        except OSError:
            return False
    try:
        vstat(path)
        return True
    except OSError:
        return False
print(ls_dir({path}))
"#,
            path = py_quote(&path)
        );
        let out = self.exec_text(&code)?;
        parse_bool(&out)
    }

    /// Read a file. UTF-8 content comes back as text; anything else is
    /// hex-encoded with `is_binary` set.
    pub fn cat(&mut self, path: &str) -> Result<CatResult> {
        let path = self.path(path);
        let code = format!(
            r#"import sys
f = open({path}, 'rb')
while True:
    chunk = f.read({chunk})
    if not chunk:
        break
    sys.stdout.buffer.write(chunk)
f.close()
"#,
            path = py_quote(&path),
            chunk = DEVICE_CHUNK
        );
        let raw = self.repl.exec_snippet(&code)?;
        match String::from_utf8(raw) {
            Ok(text) => Ok(CatResult { content: text, is_binary: false }),
            Err(err) => {
                let bytes = err.into_bytes();
                let mut hex = String::with_capacity(bytes.len() * 2);
                for b in bytes {
                    hex.push_str(&format!("{b:02x}"));
                }
                Ok(CatResult { content: hex, is_binary: true })
            }
        }
    }

    /// Recursively create `dir`; `EEXIST` at leaves counts as success.
    pub fn mkdir(&mut self, dir: &str) -> Result<bool> {
        let dir = self.path(dir);
        let code = format!(
            r#"import os
def mkdir(dir):
    parts = [p for p in dir.split('/') if p]
    made = 0
    cur = ''
    for p in parts:
        cur = cur + '/' + p
        try:
            os.mkdir(cur)
            made += 1
        except OSError as e:
            if 'EEXIST' in str(e) or (e.args and e.args[0] == 17):
                continue
            raise
    return made > 0
print(mkdir({dir}))
"#,
            dir = py_quote(&dir)
        );
        let out = self.exec_text(&code)?;
        parse_bool(&out)
    }

    pub fn rm(&mut self, path: &str) -> Result<()> {
        let path = self.path(path);
        let code = format!("import os\nos.remove({})\n", py_quote(&path));
        self.exec_text(&code).map(|_| ())
    }

    /// Depth-first removal, tolerating per-entry failures.
    pub fn rmdir(&mut self, dir: &str) -> Result<()> {
        let dir = self.path(dir);
        let code = if self.core == "EFR32MG" {
            format!(
                r#"import os
def rmdir(dir):
    os.chdir(dir)
    for f in os.listdir():
        try:
            os.remove(f)
        except OSError:
            pass
    for f in os.listdir():
        rmdir(f)
    os.chdir('..')
    os.rmdir(dir)
rmdir({dir})
"#,
                dir = py_quote(&dir)
            )
        } else {
            format!(
                r#"import os
def rmdir(p):
    for name in os.listdir(p):
        fp = p + '/' + name if p != '/' else '/' + name
        try:
            if os.stat(fp)[0] & 0x4000:
                rmdir(fp)
            else:
                os.remove(fp)
        except OSError:
            try:
                rmdir(fp)
            except OSError:
                pass
    os.rmdir(p)
rmdir({dir})
"#,
                dir = py_quote(&dir)
            )
        };
        self.exec_text(&code).map(|_| ())
    }

    /// Create an empty file, or leave an existing one untouched.
    pub fn touch(&mut self, path: &str) -> Result<()> {
        let path = self.path(path);
        let code = format!("f = open({}, 'a')\nf.close()\n", py_quote(&path));
        self.exec_text(&code).map(|_| ())
    }

    /// Device-side copy; directories copy recursively.
    pub fn cp(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = self.path(src);
        let dst = self.path(dst);
        let code = format!(
            r#"import os
def cp(s, d):
    if os.stat(s)[0] & 0x4000:
        try:
            os.mkdir(d)
        except OSError:
            pass
        for n in os.listdir(s):
            cp(s + '/' + n, d + '/' + n)
    else:
        sf = open(s, 'rb')
        df = open(d, 'wb')
        while True:
            b = sf.read({chunk})
            if not b:
                break
            df.write(b)
        sf.close()
        df.close()
cp({src}, {dst})
"#,
            chunk = DEVICE_CHUNK,
            src = py_quote(&src),
            dst = py_quote(&dst)
        );
        self.exec_text(&code).map(|_| ())
    }

    /// Rename when the port supports it, else copy-and-remove.
    pub fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        let src_n = self.path(src);
        let dst_n = self.path(dst);
        let code = format!(
            "import os\ntry:\n    os.rename({src}, {dst})\n    print('renamed')\nexcept OSError:\n    print('copy')\n",
            src = py_quote(&src_n),
            dst = py_quote(&dst_n)
        );
        let out = self.exec_text(&code)?;
        if out.contains("renamed") {
            return Ok(());
        }
        self.cp(src, dst)?;
        let is_dir = self.is_dir(src)?;
        if is_dir {
            self.rmdir(src)
        } else {
            self.rm(src)
        }
    }

    /// Core-keyed filesystem format. Unsupported cores report `formatted:
    /// false`; a few cores need the caller to reconnect afterwards.
    pub fn format(&mut self) -> Result<FormatOutcome> {
        let code = match board::normalize_core(&self.core).as_str() {
            "ESP32" => "import os\nos.fsformat('/flash')\n",
            "ESP32S3" | "ESP32C5" | "ESP32C6" | "ESP32P4" => {
                "import os\nfrom flashbdev import bdev\nos.umount('/')\nos.VfsLfs2.mkfs(bdev)\nos.mount(bdev, '/')\n"
            }
            "EFR32MG" => "import os\nos.format()\n",
            "RP2350" | "MIMXRT1062DVJ6A" => {
                "import os, rp2\nbdev = rp2.Flash()\nos.VfsFat.mkfs(bdev)\nos.mount(bdev, '/')\n"
            }
            _ => return Ok(FormatOutcome { formatted: false, reconnect: false }),
        };
        self.exec_text(code)?;
        let reconnect = board::normalize_core(&self.core) == "EFR32MG";
        Ok(FormatOutcome { formatted: true, reconnect })
    }

    /// Collect garbage and report heap usage.
    pub fn mem(&mut self) -> Result<MemInfo> {
        let code = r#"import gc
gc.collect()
free = gc.mem_free()
alloc = gc.mem_alloc()
total = free + alloc
print(free, alloc, total, round(alloc / total * 100, 2))
"#;
        let out = self.exec_text(code)?;
        parse_mem(&out)
    }

    /// Filesystem usage from `os.statvfs`.
    pub fn df(&mut self) -> Result<DfInfo> {
        let code = format!(
            r#"import os
stats = os.statvfs({root})
total = stats[0] * stats[2]
free = stats[0] * stats[3]
used = total - free
print(total, used, free, round(used / total * 100, 2))
"#,
            root = py_quote(&self.root_fs)
        );
        let out = self.exec_text(&code)?;
        parse_df(&out)
    }
}

fn ls_snippet(dir: &str) -> String {
    format!(
        r#"import os
import json
import sys
def fallback_size(path):
    try:
        f = open(path, 'rb')
        f.seek(0, 2)
        size = f.tell()
        f.close()
        return size
    except OSError:
        return 0
def get_detailed_listing(path):
    items = []
    for item in os.listdir(path):
        full = path + ('/' + item if path != '/' else item)
        if sys.platform == 'xbee3-zigbee':
            size = fallback_size(full)
            items.append([item, size, size == 0])
            continue
        try:
            st = os.stat(full)
            d = st[0] & 0x4000 != 0
            items.append([item, 0 if d else st[6], d])
        except OSError:
            try:
                os.listdir(full)
                items.append([item, 0, True])
            except OSError:
                items.append([item, 0, False])
    return sorted(items, key=lambda x: (not x[2], x[0].lower()))
print(json.dumps(get_detailed_listing({path})))
"#,
        path = py_quote(dir)
    )
}

fn sort_entries(entries: &mut [LsEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir.cmp(&a.is_dir).then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

fn parse_ls_json(out: &str) -> Result<Vec<LsEntry>> {
    let value: Value = serde_json::from_str(out.trim())
        .map_err(|e| ReplError::device(format!("unparseable listing: {e}")))?;
    let items = value
        .as_array()
        .ok_or_else(|| ReplError::device("listing is not an array"))?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let row = item
            .as_array()
            .ok_or_else(|| ReplError::device("listing row is not an array"))?;
        if row.len() != 3 {
            return Err(ReplError::device("listing row arity mismatch"));
        }
        entries.push(LsEntry {
            name: row[0].as_str().unwrap_or_default().to_owned(),
            size: row[1].as_u64().unwrap_or(0),
            is_dir: row[2].as_bool().unwrap_or(false),
        });
    }
    Ok(entries)
}

fn parse_bool(out: &str) -> Result<bool> {
    match out.trim() {
        "True" => Ok(true),
        "False" => Ok(false),
        other => Err(ReplError::device(format!("expected True/False, got {other:?}"))),
    }
}

fn parse_mem(out: &str) -> Result<MemInfo> {
    let fields: Vec<&str> = out.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(ReplError::device(format!("unexpected mem output: {out:?}")));
    }
    Ok(MemInfo {
        free: fields[0].parse().map_err(|_| ReplError::device("bad mem free"))?,
        alloc: fields[1].parse().map_err(|_| ReplError::device("bad mem alloc"))?,
        total: fields[2].parse().map_err(|_| ReplError::device("bad mem total"))?,
        percent: fields[3].parse().map_err(|_| ReplError::device("bad mem percent"))?,
    })
}

fn parse_df(out: &str) -> Result<DfInfo> {
    let fields: Vec<&str> = out.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(ReplError::device(format!("unexpected df output: {out:?}")));
    }
    Ok(DfInfo {
        total: fields[0].parse().map_err(|_| ReplError::device("bad df total"))?,
        used: fields[1].parse().map_err(|_| ReplError::device("bad df used"))?,
        free: fields[2].parse().map_err(|_| ReplError::device("bad df free"))?,
        percent: fields[3].parse().map_err(|_| ReplError::device("bad df percent"))?,
    })
}

#[cfg(test)]
#[path = "device_fs_tests.rs"]
mod tests;
