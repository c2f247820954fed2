use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::config::ConfigError;
use crate::mem::request::{CoherenceOp, MemRequest};

const TRACE_BATCH: usize = 10_000;

/// Collects the per-controller access stream into fixed-size ring buffers
/// and appends full batches to `<dir>/<name>trace.bin`. The file starts
/// with a `u32` count header and then alternates batches of 10000
/// addresses and 10000 type codes (1 = write, 0 = read).
pub struct TraceCollector {
    path: PathBuf,
    addrs: Vec<u64>,
    types: Vec<u32>,
}

impl TraceCollector {
    pub fn new(dir: &Path, name: &str) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::TraceDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{name}trace.bin"));
        let file = File::create(&path).map_err(|source| ConfigError::TraceDir {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        writer
            .write_u32::<LittleEndian>(0)
            .map_err(|source| ConfigError::TraceDir {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            addrs: Vec::with_capacity(TRACE_BATCH),
            types: Vec::with_capacity(TRACE_BATCH),
        })
    }

    pub fn record(&mut self, req: &MemRequest) {
        self.addrs.push(req.line_addr);
        self.types
            .push(u32::from(req.op == CoherenceOp::PutExclusive));
        if self.addrs.len() == TRACE_BATCH {
            self.flush();
        }
    }

    /// Appends one full batch; short batches at shutdown are dropped, the
    /// format only carries complete ones.
    fn flush(&mut self) {
        let file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("trace append to {} failed: {err}", self.path.display());
                self.addrs.clear();
                self.types.clear();
                return;
            }
        };
        let mut writer = BufWriter::new(file);
        let mut ok = true;
        for &addr in &self.addrs {
            ok &= writer.write_u64::<LittleEndian>(addr).is_ok();
        }
        for &ty in &self.types {
            ok &= writer.write_u32::<LittleEndian>(ty).is_ok();
        }
        if !ok {
            log::warn!("short trace write to {}", self.path.display());
        }
        self.addrs.clear();
        self.types.clear();
    }
}

/// Reads back a trace produced by `TraceCollector`, yielding
/// `(line_addr, is_write)` pairs. Used by the replay driver.
pub fn read_trace(path: &Path) -> std::io::Result<Vec<(u64, bool)>> {
    use byteorder::ReadBytesExt;
    use std::io::BufReader;

    let mut reader = BufReader::new(File::open(path)?);
    let _header = reader.read_u32::<LittleEndian>()?;
    let mut out = Vec::new();
    loop {
        let mut addrs = Vec::with_capacity(TRACE_BATCH);
        for _ in 0..TRACE_BATCH {
            match reader.read_u64::<LittleEndian>() {
                Ok(v) => addrs.push(v),
                Err(_) => return Ok(out),
            }
        }
        let mut types = Vec::with_capacity(TRACE_BATCH);
        for _ in 0..TRACE_BATCH {
            match reader.read_u32::<LittleEndian>() {
                Ok(v) => types.push(v),
                Err(_) => return Ok(out),
            }
        }
        out.extend(addrs.into_iter().zip(types).map(|(a, t)| (a, t == 1)));
    }
}
