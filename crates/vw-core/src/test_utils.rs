//! Test utilities for vw-core.
//!
//! This module provides fixtures for unit and integration tests:
//! - `PerfDataFileBuilder` writes valid version 2 instrumentation regions
//! - `FakeRoot` lays out current and legacy backing files in a temp root
//! - `ChannelListener` forwards every event to an `mpsc` channel
//! - `ScriptedView` / `ScriptedDecoder` replay canned variable sets

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use vw_common::{Error, InstanceId, Result};

use crate::attach::AttachedBuffer;
use crate::discovery::{HostTempDirs, TempDirectories};
use crate::monitor::events::{
    HostListener, InstanceListener, MonitorEvent, MonitorStatusChangeEvent, MonitorsUpdatedEvent,
    VmStatusChangeEvent,
};
use crate::perfdata::decoder::{ENTRY_HEADER_LEN, MAGIC, PROLOGUE_LEN, TYPE_BYTE, TYPE_LONG};
use crate::perfdata::{Decoder, InstrumentationView, VariableHandle, VariableSnapshot};

// ============================================================================
// Instrumentation regions
// ============================================================================

enum FixtureValue {
    Long(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Builds hsperfdata v2 regions.
pub struct PerfDataFileBuilder {
    little_endian: bool,
    major: u8,
    minor: u8,
    accessible: bool,
    capacity: usize,
    entries: Vec<(String, FixtureValue)>,
}

impl Default for PerfDataFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

impl PerfDataFileBuilder {
    pub fn new() -> Self {
        PerfDataFileBuilder {
            little_endian: true,
            major: 2,
            minor: 0,
            accessible: true,
            capacity: 0,
            entries: Vec::new(),
        }
    }

    pub fn long(mut self, name: &str, value: i64) -> Self {
        self.entries.push((name.to_string(), FixtureValue::Long(value)));
        self
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.entries
            .push((name.to_string(), FixtureValue::Text(value.to_string())));
        self
    }

    pub fn bytes(mut self, name: &str, value: Vec<u8>) -> Self {
        self.entries.push((name.to_string(), FixtureValue::Bytes(value)));
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.little_endian = false;
        self
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.major = major;
        self.minor = minor;
        self
    }

    pub fn inaccessible(mut self) -> Self {
        self.accessible = false;
        self
    }

    /// Pad the region to at least `bytes`, so rewrites keep the file size.
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes;
        self
    }

    fn i32_bytes(&self, v: i32) -> [u8; 4] {
        if self.little_endian {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        }
    }

    fn i64_bytes(&self, v: i64) -> [u8; 8] {
        if self.little_endian {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        }
    }

    fn entry(&self, name: &str, value: &FixtureValue) -> Vec<u8> {
        let name_offset = ENTRY_HEADER_LEN;
        let data_offset = align8(name_offset + name.len() + 1);
        let (data_type, units, variability, vector_length, data): (u8, u8, u8, usize, Vec<u8>) =
            match value {
                FixtureValue::Long(v) => (TYPE_LONG, 4, 3, 0, self.i64_bytes(*v).to_vec()),
                FixtureValue::Text(s) => {
                    let mut data = s.as_bytes().to_vec();
                    data.push(0);
                    (TYPE_BYTE, 5, 1, data.len(), data)
                }
                FixtureValue::Bytes(b) => (TYPE_BYTE, 1, 3, b.len(), b.clone()),
            };
        let entry_length = align8(data_offset + data.len());

        let mut out = Vec::with_capacity(entry_length);
        out.extend_from_slice(&self.i32_bytes(entry_length as i32));
        out.extend_from_slice(&self.i32_bytes(name_offset as i32));
        out.extend_from_slice(&self.i32_bytes(vector_length as i32));
        out.extend_from_slice(&[data_type, 0, units, variability]);
        out.extend_from_slice(&self.i32_bytes(data_offset as i32));
        out.extend_from_slice(name.as_bytes());
        out.resize(data_offset, 0);
        out.extend_from_slice(&data);
        out.resize(entry_length, 0);
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let body: Vec<u8> = self
            .entries
            .iter()
            .flat_map(|(name, value)| self.entry(name, value))
            .collect();
        let used = PROLOGUE_LEN + body.len();

        let mut out = Vec::with_capacity(used.max(self.capacity));
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(if self.little_endian { 1 } else { 0 });
        out.push(self.major);
        out.push(self.minor);
        out.push(u8::from(self.accessible));
        out.extend_from_slice(&self.i32_bytes(used as i32));
        out.extend_from_slice(&self.i32_bytes(0));
        out.extend_from_slice(&self.i64_bytes(0));
        out.extend_from_slice(&self.i32_bytes(PROLOGUE_LEN as i32));
        out.extend_from_slice(&self.i32_bytes(self.entries.len() as i32));
        out.extend_from_slice(&body);
        out.resize(used.max(self.capacity), 0);
        out
    }

    /// Write the region in place, without truncating an existing file first.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let bytes = self.build();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        if file.metadata()?.len() < bytes.len() as u64 {
            file.set_len(bytes.len() as u64)?;
        }
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.flush()
    }
}

// ============================================================================
// Temp roots
// ============================================================================

/// A temporary directory standing in for `/tmp`.
pub struct FakeRoot {
    dir: tempfile::TempDir,
}

impl Default for FakeRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRoot {
    pub fn new() -> Self {
        FakeRoot {
            dir: tempfile::Builder::new()
                .prefix("vw-root-")
                .tempdir()
                .expect("create temp root"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Resolver scanning only this root, with procfs lookups disabled.
    pub fn temp_dirs(&self) -> Arc<dyn TempDirectories> {
        Arc::new(
            HostTempDirs::new()
                .with_roots(vec![self.path().to_path_buf()])
                .with_proc_root(self.path().join(".no-proc")),
        )
    }

    /// `<root>/hsperfdata_<user>/<id>`
    pub fn add_current(&self, user: &str, id: u32, region: &PerfDataFileBuilder) -> PathBuf {
        let dir = self.path().join(format!("hsperfdata_{}", user));
        fs::create_dir_all(&dir).expect("create user dir");
        let path = dir.join(id.to_string());
        region.write_to(&path).expect("write backing file");
        path
    }

    /// `<root>/hsperfdata_<id>[_<variant>]`
    pub fn add_legacy(
        &self,
        id: u32,
        variant: Option<u8>,
        region: &PerfDataFileBuilder,
    ) -> PathBuf {
        let name = match variant {
            Some(variant) => format!("hsperfdata_{}_{}", id, variant),
            None => format!("hsperfdata_{}", id),
        };
        let path = self.path().join(name);
        region.write_to(&path).expect("write backing file");
        path
    }

    pub fn remove(&self, path: &Path) {
        fs::remove_file(path).expect("remove backing file");
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Forwards every event it receives to a channel.
pub struct ChannelListener {
    tx: Mutex<Sender<MonitorEvent>>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelListener { tx: Mutex::new(tx) }), rx)
    }

    fn send(&self, event: MonitorEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

impl HostListener for ChannelListener {
    fn on_vm_status_changed(&self, event: &VmStatusChangeEvent) {
        self.send(event.clone().into());
    }
}

impl InstanceListener for ChannelListener {
    fn on_monitors_changed(&self, event: &MonitorStatusChangeEvent) {
        self.send(event.clone().into());
    }

    fn on_updated(&self, event: &MonitorsUpdatedEvent) {
        self.send(event.clone().into());
    }
}

// ============================================================================
// Scripted decoding
// ============================================================================

/// One scripted sample: a key set, or a decode failure.
type Step = Option<Vec<String>>;

fn snapshot_of(keys: &[String]) -> VariableSnapshot {
    keys.iter()
        .map(|k| (k.clone(), VariableHandle::long(k.clone(), 0)))
        .collect()
}

/// A view that replays a list of samples; the last one repeats forever.
pub struct ScriptedView {
    id: InstanceId,
    steps: Mutex<VecDeque<Step>>,
}

impl Default for ScriptedView {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedView {
    pub fn new() -> Self {
        ScriptedView {
            id: InstanceId(0),
            steps: Mutex::new(VecDeque::new()),
        }
    }

    fn with_steps(id: InstanceId, steps: Vec<Step>) -> Self {
        ScriptedView {
            id,
            steps: Mutex::new(steps.into()),
        }
    }

    pub fn then_keys(self, keys: &[&str]) -> Self {
        self.push(Some(keys.iter().map(|k| k.to_string()).collect()))
    }

    pub fn then_failure(self) -> Self {
        self.push(None)
    }

    fn push(self, step: Step) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
        self
    }
}

impl InstrumentationView for ScriptedView {
    fn snapshot(&self) -> Result<VariableSnapshot> {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        let step = if steps.len() > 1 {
            steps.pop_front().flatten()
        } else {
            steps.front().cloned().flatten()
        };
        match step {
            Some(keys) => Ok(snapshot_of(&keys)),
            None => Err(Error::decode(self.id, "scripted failure")),
        }
    }
}

/// Decoder handing out a fresh [`ScriptedView`] per attach.
pub struct ScriptedDecoder {
    steps: Vec<Step>,
}

impl ScriptedDecoder {
    pub fn new(samples: &[&[&str]]) -> Self {
        ScriptedDecoder {
            steps: samples
                .iter()
                .map(|keys| Some(keys.iter().map(|k| k.to_string()).collect()))
                .collect(),
        }
    }
}

impl Decoder for ScriptedDecoder {
    fn decode(
        &self,
        _buffer: Arc<AttachedBuffer>,
        id: InstanceId,
    ) -> Result<Box<dyn InstrumentationView>> {
        Ok(Box::new(ScriptedView::with_steps(id, self.steps.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perfdata::PerfDataDecoder;

    #[test]
    fn test_builder_output_decodes() {
        let bytes = PerfDataFileBuilder::new()
            .long("x", 3)
            .text("y", "z")
            .capacity(4096)
            .build();
        assert_eq!(bytes.len(), 4096);
        let buffer = Arc::new(AttachedBuffer::from_bytes(InstanceId(1), bytes));
        let view = PerfDataDecoder::new().decode(buffer, InstanceId(1)).unwrap();
        assert_eq!(view.snapshot().unwrap().len(), 2);
    }

    #[test]
    fn test_fake_root_layout() {
        let root = FakeRoot::new();
        let current = root.add_current("bob", 10, &PerfDataFileBuilder::new());
        let legacy = root.add_legacy(11, Some(2), &PerfDataFileBuilder::new());
        assert!(current.ends_with("hsperfdata_bob/10"));
        assert!(legacy.ends_with("hsperfdata_11_2"));
        root.remove(&legacy);
        assert!(!legacy.exists());
    }

    #[test]
    fn test_scripted_view_repeats_last() {
        let view = ScriptedView::new().then_keys(&["a"]).then_failure();
        assert_eq!(view.snapshot().unwrap().len(), 1);
        assert!(view.snapshot().is_err());
        assert!(view.snapshot().is_err());
    }
}
