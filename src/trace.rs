//! Optional event trace file.
//!
//! One event per line, comma separated:
//!
//! ```text
//! 0,<counter>,<event-tag>,node<padded id>.<producer>,<millis>,"<attrs>"
//! ```
//!
//! The counter is per event tag; `attrs` is a json-like object with doubled
//! quotes, built by the call site. The file is flushed after every record so
//! a crash loses at most the line being written.

use crate::types::NodeId;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// Trace event tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum TraceEvent {
    SentData,
    SentAdv,
    SentAck,
    RcvData,
    RcvAdv,
    RcvAck,
    LocalPull,
    LocalUnpull,
    ClientProdData,
    ClientRcvData,
}

const EVENT_COUNT: usize = 10;

impl TraceEvent {
    pub fn tag(self) -> &'static str {
        match self {
            TraceEvent::SentData => "ll.gcnSentData",
            TraceEvent::SentAdv => "ll.gcnSentAdv",
            TraceEvent::SentAck => "ll.gcnSentAck",
            TraceEvent::RcvData => "ll.gcnRcvData",
            TraceEvent::RcvAdv => "ll.gcnRcvAdv",
            TraceEvent::RcvAck => "ll.gcnRcvAck",
            TraceEvent::LocalPull => "ll.gcnLocalPull",
            TraceEvent::LocalUnpull => "ll.gcnLocalUnpull",
            TraceEvent::ClientProdData => "ll.gcnClientProdData",
            TraceEvent::ClientRcvData => "ll.gcnClientRcvData",
        }
    }
}

/// Append-only trace writer with per-event counters.
pub struct TraceLog {
    writer: BufWriter<File>,
    node_id: NodeId,
    producer: &'static str,
    counters: [u64; EVENT_COUNT],
}

impl TraceLog {
    /// Create (truncating) the trace file.
    pub fn create(
        path: &Path,
        node_id: NodeId,
        producer: &'static str,
    ) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            node_id,
            producer,
            counters: [0; EVENT_COUNT],
        })
    }

    /// Append one record. `attrs` is the json-like body without the
    /// surrounding quotes.
    pub fn emit(&mut self, event: TraceEvent, attrs: &str) {
        let counter = &mut self.counters[event as usize];
        *counter += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let result = writeln!(
            self.writer,
            "0,{},{},node{:03}.{},{},\"{}\"",
            counter,
            event.tag(),
            self.node_id,
            self.producer,
            millis,
            attrs
        )
        .and_then(|_| self.writer.flush());
        if let Err(e) = result {
            error!(error = %e, "trace write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_format_and_counters() {
        let dir = std::env::temp_dir().join(format!("gcn-trace-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trace.csv");

        {
            let mut log = TraceLog::create(&path, 7, "gcnService").unwrap();
            log.emit(TraceEvent::SentAdv, r#"{""gid"":7,""seq"":1}"#);
            log.emit(TraceEvent::SentAdv, r#"{""gid"":7,""seq"":2}"#);
            log.emit(TraceEvent::LocalPull, r#"{""gid"":7}"#);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);

        let fields: Vec<&str> = lines[0].splitn(6, ',').collect();
        assert_eq!(fields[0], "0");
        assert_eq!(fields[1], "1");
        assert_eq!(fields[2], "ll.gcnSentAdv");
        assert_eq!(fields[3], "node007.gcnService");
        assert!(fields[4].parse::<u64>().is_ok());
        assert_eq!(fields[5], r#""{""gid"":7,""seq"":1}""#);

        // counters are per event tag
        assert!(lines[1].starts_with("0,2,ll.gcnSentAdv,"));
        assert!(lines[2].starts_with("0,1,ll.gcnLocalPull,"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
