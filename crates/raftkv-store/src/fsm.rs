use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::command::{Op, Transaction};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("malformed snapshot payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("snapshot i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// What applying one log entry did to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// All commands of the transaction were applied.
    Applied { commands: usize },
    /// The payload could not be decoded and was skipped.
    Malformed,
    /// Blank or membership entries, which carry no commands.
    Internal,
}

/// Applies committed log entries to a [`Store`], in the order they are
/// delivered, and captures or restores whole-store snapshots.
#[derive(Debug)]
pub struct Fsm {
    store: Store,
}

impl Fsm {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Decode `entry` as a transaction and apply it under a single write
    /// hold. Undecodable entries are logged and skipped so every replica
    /// reaches the same no-op outcome.
    pub fn apply(&self, entry: &[u8]) -> ApplyOutcome {
        let tx = match Transaction::decode(entry) {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(len = entry.len(), "skipping undecodable log entry: {e}");
                return ApplyOutcome::Malformed;
            }
        };

        let commands = tx.len();
        let mut writer = self.store.write();
        for command in tx.commands {
            match command.op {
                Op::Set => writer.set(command.key, command.value, command.ttl),
                Op::Delete => writer.delete(&command.key),
            }
        }

        ApplyOutcome::Applied { commands }
    }

    /// Capture the store contents now. Serialization happens under the read
    /// lock; writing the result out happens later through
    /// [`FsmSnapshot::persist`] without holding any lock.
    pub fn snapshot(&self) -> Result<FsmSnapshot, FsmError> {
        Ok(FsmSnapshot {
            data: self.store.serialize_data()?,
        })
    }

    /// Replace the store with the key/value map read from `reader`. Keys
    /// missing from the snapshot are gone afterwards.
    pub fn restore(&self, reader: impl Read) -> Result<(), FsmError> {
        let values: BTreeMap<String, String> = serde_json::from_reader(reader)?;
        let keys = values.len();
        self.store.replace_data(values);
        tracing::info!(keys, "restored store from snapshot");
        Ok(())
    }

    /// Local, possibly stale read.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }
}

/// Point-in-time copy of the store, ready to be written to a sink.
#[derive(Clone, Debug)]
pub struct FsmSnapshot {
    data: Vec<u8>,
}

impl FsmSnapshot {
    /// Write the captured data to `sink` and close it. If any write fails
    /// the sink is cancelled instead, so no partial snapshot is committed.
    pub fn persist<S: SnapshotSink>(&self, sink: &mut S) -> Result<(), FsmError> {
        if let Err(e) = sink.write_all(&self.data).and_then(|_| sink.flush()) {
            tracing::warn!(sink = sink.id(), "snapshot write failed, cancelling: {e}");
            if let Err(cancel) = sink.cancel() {
                tracing::error!(sink = sink.id(), "failed to cancel snapshot sink: {cancel}");
            }
            return Err(e.into());
        }

        sink.close()?;
        Ok(())
    }

    /// Drop the captured bytes. Nothing else is held.
    pub fn release(self) {}
}

/// Destination of a snapshot being persisted.
///
/// A sink that has been cancelled by its owner (for example because a newer
/// snapshot superseded it) should fail subsequent writes; `persist` then
/// cancels it.
pub trait SnapshotSink: Write {
    fn id(&self) -> &str;

    /// Discard everything written so far.
    fn cancel(&mut self) -> io::Result<()>;

    /// Commit everything written so far.
    fn close(&mut self) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    Open,
    Closed,
    Cancelled,
}

/// Sink that buffers the snapshot in memory.
#[derive(Debug)]
pub struct MemorySink {
    id: String,
    buf: Vec<u8>,
    state: SinkState,
}

impl MemorySink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            buf: Vec::new(),
            state: SinkState::Open,
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// The committed bytes; fails unless the sink was closed.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self.state {
            SinkState::Closed => Ok(self.buf),
            state => Err(io::Error::other(format!(
                "snapshot sink {} is {state:?}, not closed",
                self.id
            ))),
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        match self.state {
            SinkState::Open => Ok(()),
            state => Err(io::Error::other(format!(
                "snapshot sink {} is {state:?}",
                self.id
            ))),
        }
    }
}

impl Write for MemorySink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()
    }
}

impl SnapshotSink for MemorySink {
    fn id(&self) -> &str {
        &self.id
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.state = SinkState::Cancelled;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.state = SinkState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::command::Command;
    use crate::store::StoreConfig;

    fn fsm() -> Fsm {
        Fsm::new(Store::new(StoreConfig::default()))
    }

    fn entry(tx: Transaction) -> Vec<u8> {
        tx.encode().unwrap().0
    }

    /// Fails every write after `budget` bytes.
    struct FlakySink {
        inner: MemorySink,
        budget: usize,
    }

    impl Write for FlakySink {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = bytes.len().min(self.budget);
            self.budget -= n;
            self.inner.write(&bytes[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl SnapshotSink for FlakySink {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn cancel(&mut self) -> io::Result<()> {
            self.inner.cancel()
        }

        fn close(&mut self) -> io::Result<()> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn set_then_delete() {
        let fsm = fsm();

        let outcome = fsm.apply(br#"{"commands":[{"op":"set","key":"x","value":"1","ttl":0}]}"#);
        assert_eq!(outcome, ApplyOutcome::Applied { commands: 1 });
        assert_eq!(fsm.get("x").as_deref(), Some("1"));

        fsm.apply(br#"{"commands":[{"op":"delete","key":"x"}]}"#);
        assert_eq!(fsm.get("x"), None);
    }

    #[tokio::test]
    async fn later_commands_in_a_transaction_win() {
        let fsm = fsm();
        let tx = Transaction::new()
            .set("a", "1", Duration::ZERO)
            .set("a", "2", Duration::ZERO)
            .delete("a")
            .set("b", "1", Duration::ZERO)
            .set("b", "2", Duration::ZERO);

        assert_eq!(
            fsm.apply(&entry(tx)),
            ApplyOutcome::Applied { commands: 5 }
        );
        assert_eq!(fsm.get("a"), None);
        assert_eq!(fsm.get("b").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn readers_never_observe_a_partial_transaction() {
        let fsm = fsm();
        let tx = entry(
            Transaction::new()
                .set("a", "1", Duration::ZERO)
                .set("a", "2", Duration::ZERO)
                .delete("a"),
        );
        let done = AtomicBool::new(false);

        let (outcomes, seen) = std::thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut seen = Vec::new();
                while !done.load(Ordering::Acquire) {
                    seen.extend(fsm.get("a"));
                }
                seen
            });
            let outcomes = (0..20_000).map(|_| fsm.apply(&tx)).collect::<Vec<_>>();
            done.store(true, Ordering::Release);
            (outcomes, reader.join().unwrap())
        });

        assert!(outcomes
            .iter()
            .all(|o| *o == ApplyOutcome::Applied { commands: 3 }));
        assert_eq!(seen, Vec::<String>::new());
    }

    #[tokio::test]
    async fn malformed_entries_leave_the_store_untouched() {
        let fsm = fsm();
        fsm.apply(&entry(Command::set("k", "v", Duration::ZERO).into()));

        let garbage: [&[u8]; 4] = [b"not json", b"", br#"{"commands": 7}"#, &[0xff, 0xfe, 0x00]];
        for garbage in garbage {
            assert_eq!(fsm.apply(garbage), ApplyOutcome::Malformed);
        }

        assert_eq!(fsm.get("k").as_deref(), Some("v"));
        assert_eq!(fsm.snapshot().unwrap().data, br#"{"k":"v"}"#);
    }

    #[tokio::test]
    async fn persist_then_restore_reproduces_contents() {
        let source = fsm();
        source.apply(&entry(
            Transaction::new()
                .set("a", "1", Duration::ZERO)
                .set("b", "2", Duration::from_secs(600))
                .set("c", "3", Duration::ZERO),
        ));

        let snapshot = source.snapshot().unwrap();
        let mut sink = MemorySink::new("snap-1");
        snapshot.persist(&mut sink).unwrap();
        snapshot.release();
        let bytes = sink.into_bytes().unwrap();

        let target = fsm();
        target.apply(&entry(Command::set("stale", "x", Duration::ZERO).into()));
        target.restore(bytes.as_slice()).unwrap();

        assert_eq!(target.get("stale"), None);
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            assert_eq!(target.get(k).as_deref(), Some(v));
        }
        assert_eq!(
            target.snapshot().unwrap().data,
            source.snapshot().unwrap().data
        );
    }

    #[tokio::test]
    async fn failed_write_cancels_the_sink() {
        let fsm = fsm();
        fsm.apply(&entry(
            Transaction::new()
                .set("a", "a fairly long value", Duration::ZERO)
                .set("b", "another fairly long value", Duration::ZERO),
        ));

        let mut sink = FlakySink {
            inner: MemorySink::new("snap-2"),
            budget: 8,
        };
        let err = fsm.snapshot().unwrap().persist(&mut sink).unwrap_err();

        assert!(matches!(err, FsmError::Io(_)));
        assert_eq!(sink.inner.state(), SinkState::Cancelled);
        assert!(sink.inner.into_bytes().is_err());
    }

    #[tokio::test]
    async fn cancelled_sink_is_not_committed() {
        let fsm = fsm();
        fsm.apply(&entry(Command::set("k", "v", Duration::ZERO).into()));

        let mut sink = MemorySink::new("superseded");
        sink.cancel().unwrap();

        assert!(fsm.snapshot().unwrap().persist(&mut sink).is_err());
        assert_eq!(sink.state(), SinkState::Cancelled);
    }

    #[tokio::test]
    async fn restore_rejects_malformed_snapshots() {
        let fsm = fsm();
        fsm.apply(&entry(Command::set("k", "v", Duration::ZERO).into()));

        let err = fsm.restore(&b"[1, 2, 3]"[..]).unwrap_err();
        assert!(matches!(err, FsmError::Decode(_)));
        assert_eq!(fsm.get("k").as_deref(), Some("v"));
    }
}
