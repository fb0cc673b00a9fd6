//! The sink cluster writer.
//!
//! One lock serializes adds and flushes across every sink in the cluster.
//! A window either closes cleanly for all sinks or `last_write_time` stays
//! put and the next tick retries.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ipset::IpSetSink;

/// A durable byte destination: append plus an fsync-equivalent barrier.
pub trait WriteSyncer: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
}

impl WriteSyncer for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// One recording window of one sink, as serialized to the log.
#[derive(Debug, Serialize, Deserialize)]
pub struct SinkEntry {
    #[serde(rename = "RecordingStart")]
    pub recording_start: DateTime<Utc>,
    #[serde(rename = "RecordingEnd")]
    pub recording_end: DateTime<Utc>,
    #[serde(rename = "Recorded", with = "base64_bytes")]
    pub recorded: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

struct Sink {
    writer: Box<dyn WriteSyncer>,
    current: IpSetSink,
}

struct Inner {
    sinks: HashMap<String, Sink>,
    last_write_time: DateTime<Utc>,
}

pub struct ClusterWriter {
    inner: Mutex<Inner>,
    write_interval: chrono::Duration,
}

impl ClusterWriter {
    /// Build a cluster over the given named writers. Every sink shares the
    /// same 32-byte set key. All sinks a caller will ever add to must be
    /// registered here.
    pub fn new(
        writers: HashMap<String, Box<dyn WriteSyncer>>,
        key: [u8; 32],
        write_interval: Duration,
    ) -> Self {
        let sinks = writers
            .into_iter()
            .map(|(name, writer)| {
                (
                    name,
                    Sink {
                        writer,
                        current: IpSetSink::new(&key),
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                sinks,
                last_write_time: Utc::now(),
            }),
            write_interval: chrono::Duration::from_std(write_interval)
                .expect("write interval out of range"),
        }
    }

    /// Record an address sighting in the named sink. If the current window
    /// has expired, it is flushed before the new address enters the next
    /// one.
    ///
    /// Panics on a name that was never registered; registration is a
    /// construction-time contract.
    pub fn add_ip_to_set(&self, name: &str, ip: &str) {
        let mut inner = self.inner.lock().expect("sink cluster lock poisoned");
        if inner.last_write_time + self.write_interval < Utc::now() {
            Self::flush_locked(&mut inner);
        }
        inner
            .sinks
            .get_mut(name)
            .unwrap_or_else(|| panic!("sink {name:?} is not registered"))
            .current
            .add_ip(ip);
    }

    /// Flush every sink now. Called by the timer task and once at shutdown.
    pub fn write_ip_set_to_disk(&self) {
        let mut inner = self.inner.lock().expect("sink cluster lock poisoned");
        Self::flush_locked(&mut inner);
    }

    fn flush_locked(inner: &mut Inner) {
        let current_time = Utc::now();
        let recording_start = inner.last_write_time;
        for sink in inner.sinks.values_mut() {
            let entry = SinkEntry {
                recording_start,
                recording_end: current_time,
                recorded: sink.current.dump(),
            };
            let mut line = match serde_json::to_vec(&entry) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "unable to write ipset to file");
                    return;
                }
            };
            line.push(b'\n');
            if let Err(e) = sink.writer.write_all(&line) {
                tracing::warn!(error = %e, "unable to write ipset to file");
                return;
            }
            if let Err(e) = sink.writer.sync() {
                tracing::warn!(error = %e, "unable to write ipset to file");
                return;
            }
            sink.current.reset();
        }
        inner.last_write_time = current_time;
    }

    #[cfg(test)]
    fn backdate_last_write(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_write_time = inner.last_write_time - chrono::Duration::from_std(by).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct BufferSyncer(Arc<Mutex<Vec<u8>>>);

    impl Write for BufferSyncer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl WriteSyncer for BufferSyncer {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingSyncer;

    impl Write for FailingSyncer {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl WriteSyncer for FailingSyncer {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn random_key() -> [u8; 32] {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    fn demo_cluster() -> (ClusterWriter, BufferSyncer) {
        let buffer = BufferSyncer::default();
        let mut writers: HashMap<String, Box<dyn WriteSyncer>> = HashMap::new();
        writers.insert("demo".into(), Box::new(buffer.clone()));
        let cluster = ClusterWriter::new(writers, random_key(), Duration::from_secs(60));
        (cluster, buffer)
    }

    fn lines(buffer: &BufferSyncer) -> Vec<SinkEntry> {
        let bytes = buffer.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).expect("log is utf-8");
        text.lines()
            .map(|l| serde_json::from_str(l).expect("each line is a SinkEntry"))
            .collect()
    }

    #[test]
    fn flush_writes_one_json_line() {
        let (cluster, buffer) = demo_cluster();
        cluster.add_ip_to_set("demo", "1.2.3.4");
        cluster.write_ip_set_to_disk();

        let raw = buffer.0.lock().unwrap().clone();
        assert_eq!(raw.iter().filter(|&&b| b == b'\n').count(), 1);
        assert!(raw.ends_with(b"\n"));

        let entries = lines(&buffer);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].recorded.is_empty());
        assert!(entries[0].recording_start <= entries[0].recording_end);
    }

    #[test]
    fn second_flush_is_a_fresh_empty_window() {
        let (cluster, buffer) = demo_cluster();
        cluster.add_ip_to_set("demo", "1.2.3.4");
        cluster.write_ip_set_to_disk();
        cluster.write_ip_set_to_disk();

        let entries = lines(&buffer);
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].recorded, entries[1].recorded);
        // The second window saw no addresses: all-zero registers.
        assert!(entries[1].recorded.iter().all(|&b| b == 0));
    }

    #[test]
    fn expired_window_flushes_before_add() {
        let (cluster, buffer) = demo_cluster();
        cluster.backdate_last_write(Duration::from_secs(120));
        cluster.add_ip_to_set("demo", "1.2.3.4");

        // The flushed window predates the add, so it must be empty.
        let entries = lines(&buffer);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].recorded.iter().all(|&b| b == 0));

        // And the address lands in the following window.
        cluster.write_ip_set_to_disk();
        let entries = lines(&buffer);
        assert_eq!(entries.len(), 2);
        assert!(entries[1].recorded.iter().any(|&b| b != 0));
    }

    #[test]
    fn fresh_window_does_not_flush_on_add() {
        let (cluster, buffer) = demo_cluster();
        cluster.add_ip_to_set("demo", "1.2.3.4");
        assert!(buffer.0.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_flush_keeps_window_open() {
        let mut writers: HashMap<String, Box<dyn WriteSyncer>> = HashMap::new();
        writers.insert("bad".into(), Box::new(FailingSyncer));
        let cluster = ClusterWriter::new(writers, random_key(), Duration::from_secs(60));
        cluster.add_ip_to_set("bad", "1.2.3.4");

        let before = cluster.inner.lock().unwrap().last_write_time;
        cluster.write_ip_set_to_disk();
        let after = cluster.inner.lock().unwrap().last_write_time;
        assert_eq!(before, after, "failed flush must not advance the window");
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn unknown_sink_name_panics() {
        let (cluster, _buffer) = demo_cluster();
        cluster.add_ip_to_set("nope", "1.2.3.4");
    }

    #[test]
    fn entry_json_uses_wire_field_names() {
        let (cluster, buffer) = demo_cluster();
        cluster.write_ip_set_to_disk();
        let bytes = buffer.0.lock().unwrap().clone();
        let v: serde_json::Value = serde_json::from_slice(
            bytes.strip_suffix(b"\n").unwrap(),
        )
        .unwrap();
        assert!(v.get("RecordingStart").is_some());
        assert!(v.get("RecordingEnd").is_some());
        assert!(v["Recorded"].is_string());
    }
}
