//! Out-of-order message repair.
//!
//! The sorter tracks sequence numbers per `(sender, destination port)`
//! stream. It can re-order swapped messages (series like 1-2-4-3-5) when
//! the missing message arrives within the reorder deadline, and it counts
//! dropouts without ever requesting a retransmission. At most two
//! datagrams per stream are deferred; everything else is emitted
//! immediately.
//!
//! Sorter state is strictly per stream: a straggler buffered for one
//! stream can never block or evict a datagram of an unrelated stream.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{StageMsg, MAX_SPECIAL_PORT};
use crate::stats::MessageStat;

/// Shared per-peer message statistics, updated by the sorter and read by
/// the periodic reporter.
pub type SharedMessageStats = Arc<Mutex<HashMap<u8, MessageStat>>>;

/// One out-of-order emission, reported for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqError {
    pub cid: u8,
    pub dest_port: u16,
    pub expected: i16,
    pub received: i16,
}

#[derive(Default)]
struct StreamState {
    /// Sequence number of the most recent arrival.
    seq_in: i16,
    /// Sequence number of the most recent emission.
    seq_out: i16,
    /// False until the first arrival; the first delta is not a loss.
    started: bool,
    buf1: Option<StageMsg>,
    buf2: Option<StageMsg>,
}

pub struct MessageSorter {
    streams: HashMap<(u8, u16), StreamState>,
    stats: SharedMessageStats,
    errors: Vec<SeqError>,
}

impl Default for MessageSorter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSorter {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            stats: Arc::new(Mutex::new(HashMap::new())),
            errors: Vec::new(),
        }
    }

    /// Handle to the statistics map for the roll-up reporter.
    pub fn stats_handle(&self) -> SharedMessageStats {
        Arc::clone(&self.stats)
    }

    /// Statistics snapshot for one peer.
    pub fn get_stat(&self, cid: u8) -> MessageStat {
        self.stats.lock().get(&cid).copied().unwrap_or_default()
    }

    /// Out-of-order emissions recorded since the last call.
    pub fn drain_errors(&mut self) -> Vec<SeqError> {
        mem::take(&mut self.errors)
    }

    /// Process one arrival. Returns the datagrams that are ready for
    /// delivery, in order; an empty result means the arrival was deferred
    /// waiting for a possible straggler.
    pub fn process(&mut self, msg: StageMsg) -> Vec<StageMsg> {
        // Control traffic passes through untouched.
        if msg.dest_port <= MAX_SPECIAL_PORT {
            return vec![msg];
        }

        let key = (msg.cid, msg.dest_port);
        let mut stats = self.stats.lock();
        let stat = stats.entry(msg.cid).or_default();
        let stream = self.streams.entry(key).or_default();
        let mut out = Vec::with_capacity(2);

        stat.received += 1;
        let notfirst = stream.started;
        let d_in = msg.seq.wrapping_sub(stream.seq_in);
        stream.seq_in = msg.seq;
        stream.started = true;
        let d_io = msg.seq.wrapping_sub(stream.seq_out);

        // A dropout charges the gap width; a late arrival of an older
        // message compensates it back (d_in - 1 is negative then), so a
        // repaired swap nets to zero loss.
        if notfirst && d_in != 0 {
            stat.lost += d_in as i64 - 1;
        }

        // Gap on both axes: defer the datagram, granting the missing
        // message one reorder deadline to arrive.
        if d_in > 1 && d_io > 1 {
            if let Some(stale) = stream.buf1.take() {
                emit(stream, stale, stat, &mut self.errors, &mut out);
            }
            stream.buf1 = Some(msg);
            return out;
        }

        stat.seqerr_in += (d_in < 0) as u64;

        // An older message may still be missing; if a deferred datagram of
        // this stream precedes the current one, release it first.
        if d_in < -1 || (d_io > 1 && d_in > 0) {
            let release = stream
                .buf1
                .as_ref()
                .is_some_and(|b| msg.seq.wrapping_sub(b.seq) > 0);
            if release {
                let first = stream.buf1.take().expect("checked above");
                stream.buf2 = Some(msg);
                emit(stream, first, stat, &mut self.errors, &mut out);
                drain_deferred(stream, stat, &mut self.errors, &mut out);
                return out;
            }
        }

        emit(stream, msg, stat, &mut self.errors, &mut out);
        drain_deferred(stream, stat, &mut self.errors, &mut out);
        out
    }

    /// Release all deferred datagrams. Called when the reorder deadline
    /// elapses without new input.
    pub fn flush(&mut self) -> Vec<StageMsg> {
        let mut out = Vec::new();
        let mut stats = self.stats.lock();
        for ((cid, _), stream) in self.streams.iter_mut() {
            let stat = stats.entry(*cid).or_default();
            drain_deferred(stream, stat, &mut self.errors, &mut out);
        }
        out
    }
}

/// Emit one datagram, updating the output sequence and charging
/// `seqerr_out` when the emission goes backwards.
fn emit(
    stream: &mut StreamState,
    msg: StageMsg,
    stat: &mut MessageStat,
    errors: &mut Vec<SeqError>,
    out: &mut Vec<StageMsg>,
) {
    let d_out = msg.seq.wrapping_sub(stream.seq_out);
    if d_out < 0 {
        stat.seqerr_out += 1;
        errors.push(SeqError {
            cid: msg.cid,
            dest_port: msg.dest_port,
            expected: stream.seq_out.wrapping_add(1),
            received: msg.seq,
        });
    }
    stream.seq_out = msg.seq;
    out.push(msg);
}

fn drain_deferred(
    stream: &mut StreamState,
    stat: &mut MessageStat,
    errors: &mut Vec<SeqError>,
    out: &mut Vec<StageMsg>,
) {
    if let Some(first) = stream.buf1.take() {
        emit(stream, first, stat, errors, out);
    }
    if let Some(second) = stream.buf2.take() {
        emit(stream, second, stat, errors, out);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::protocol::PORT_PING;

    const CID: u8 = 13;
    const PORT: u16 = 1234;

    fn msg(seq: i16) -> StageMsg {
        msg_on(CID, PORT, seq)
    }

    fn msg_on(cid: u8, dest_port: u16, seq: i16) -> StageMsg {
        StageMsg {
            cid,
            dest_port,
            seq,
            payload: Vec::new(),
            sender: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4464),
        }
    }

    fn seqs(out: &[StageMsg]) -> Vec<i16> {
        out.iter().map(|m| m.seq).collect()
    }

    #[test]
    fn single_message_emits_once() {
        let mut sorter = MessageSorter::new();
        assert_eq!(vec![1], seqs(&sorter.process(msg(1))));
        assert!(sorter.flush().is_empty());
    }

    #[test]
    fn monotonic_run_emits_each_exactly_once() {
        let mut sorter = MessageSorter::new();
        for seq in 1..=100 {
            assert_eq!(vec![seq], seqs(&sorter.process(msg(seq))));
        }
        assert!(sorter.flush().is_empty());
        let stat = sorter.get_stat(CID);
        assert_eq!(100, stat.received);
        assert_eq!(0, stat.lost);
        assert_eq!(0, stat.seqerr_out);
    }

    #[test]
    fn swap_is_repaired_in_order() {
        let mut sorter = MessageSorter::new();
        assert_eq!(vec![1], seqs(&sorter.process(msg(1))));
        assert_eq!(vec![2], seqs(&sorter.process(msg(2))));
        // 4 arrives early: deferred, waiting for 3.
        assert!(sorter.process(msg(4)).is_empty());
        // 3 arrives within the deadline: both come out in order.
        assert_eq!(vec![3, 4], seqs(&sorter.process(msg(3))));
        assert_eq!(vec![5], seqs(&sorter.process(msg(5))));
        assert_eq!(vec![6], seqs(&sorter.process(msg(6))));

        let stat = sorter.get_stat(CID);
        assert_eq!(0, stat.lost);
        assert_eq!(1, stat.seqerr_in);
        assert_eq!(0, stat.seqerr_out);
        assert!(sorter.drain_errors().is_empty());
    }

    #[test]
    fn deferred_message_is_released_by_its_successor() {
        let mut sorter = MessageSorter::new();
        sorter.process(msg(1));
        sorter.process(msg(2));
        assert!(sorter.process(msg(4)).is_empty());
        // 3 never arrives; 5 releases the deferred 4 ahead of itself.
        assert_eq!(vec![4, 5], seqs(&sorter.process(msg(5))));
        assert!(sorter.flush().is_empty());
    }

    #[test]
    fn dropout_is_counted_and_never_filled() {
        let mut sorter = MessageSorter::new();
        sorter.process(msg(1));
        sorter.process(msg(2));
        assert!(sorter.process(msg(5)).is_empty());
        assert_eq!(vec![5, 6], seqs(&sorter.process(msg(6))));

        let stat = sorter.get_stat(CID);
        assert_eq!(4, stat.received);
        assert_eq!(2, stat.lost);
        assert_eq!(0, stat.seqerr_out);
    }

    #[test]
    fn duplicate_sequences_pass_through() {
        let mut sorter = MessageSorter::new();
        assert_eq!(vec![1], seqs(&sorter.process(msg(1))));
        assert_eq!(vec![2], seqs(&sorter.process(msg(2))));
        assert_eq!(vec![2], seqs(&sorter.process(msg(2))));
        assert_eq!(vec![2], seqs(&sorter.process(msg(2))));
        assert!(sorter.flush().is_empty());
        assert_eq!(0, sorter.get_stat(CID).lost);
    }

    #[test]
    fn ten_packets_with_one_swap_arrive_in_order() {
        let mut sorter = MessageSorter::new();
        let mut delivered = Vec::new();
        for seq in [1, 2, 3, 4, 6, 5, 7, 8, 9, 10] {
            delivered.extend(seqs(&sorter.process(msg(seq))));
        }
        delivered.extend(seqs(&sorter.flush()));
        assert_eq!((1..=10).collect::<Vec<i16>>(), delivered);

        let stat = sorter.get_stat(CID);
        assert_eq!(0, stat.lost);
        assert_eq!(0, stat.seqerr_out);
    }

    #[test]
    fn control_ports_are_untouched() {
        let mut sorter = MessageSorter::new();
        // Wildly out-of-order control messages all pass through and leave
        // no statistics behind.
        assert_eq!(vec![500], seqs(&sorter.process(msg_on(CID, PORT_PING, 500))));
        assert_eq!(vec![-7], seqs(&sorter.process(msg_on(CID, PORT_PING, -7))));
        assert_eq!(0, sorter.get_stat(CID).received);
    }

    #[test]
    fn streams_do_not_block_each_other() {
        let mut sorter = MessageSorter::new();
        sorter.process(msg_on(1, 5000, 1));
        sorter.process(msg_on(1, 5000, 2));
        // Stream (1, 5000) defers 4.
        assert!(sorter.process(msg_on(1, 5000, 4)).is_empty());
        // An unrelated stream keeps flowing and does not evict the
        // deferred datagram.
        assert_eq!(vec![1], seqs(&sorter.process(msg_on(2, 6000, 1))));
        assert_eq!(vec![2], seqs(&sorter.process(msg_on(2, 6000, 2))));
        // The straggler still completes its swap.
        assert_eq!(vec![3, 4], seqs(&sorter.process(msg_on(1, 5000, 3))));
    }

    #[test]
    fn idle_flush_releases_deferred_datagrams() {
        let mut sorter = MessageSorter::new();
        sorter.process(msg(1));
        assert!(sorter.process(msg(3)).is_empty());
        assert_eq!(vec![3], seqs(&sorter.flush()));
        assert!(sorter.flush().is_empty());
    }

    #[test]
    fn late_emission_is_reported() {
        let mut sorter = MessageSorter::new();
        sorter.process(msg(1));
        sorter.process(msg(2));
        // 4 is deferred, then flushed before 3 arrives.
        assert!(sorter.process(msg(4)).is_empty());
        assert_eq!(vec![4], seqs(&sorter.flush()));
        // 3 now arrives too late and is emitted out of order.
        assert_eq!(vec![3], seqs(&sorter.process(msg(3))));

        let stat = sorter.get_stat(CID);
        assert_eq!(1, stat.seqerr_out);
        let errors = sorter.drain_errors();
        assert_eq!(
            vec![SeqError { cid: CID, dest_port: PORT, expected: 5, received: 3 }],
            errors
        );
    }

    #[test]
    fn sequence_wrap_is_handled() {
        let mut sorter = MessageSorter::new();
        sorter.process(msg(i16::MAX - 1));
        assert_eq!(vec![i16::MAX], seqs(&sorter.process(msg(i16::MAX))));
        assert_eq!(vec![i16::MIN], seqs(&sorter.process(msg(i16::MIN))));
        assert_eq!(
            vec![i16::MIN + 1],
            seqs(&sorter.process(msg(i16::MIN + 1)))
        );
        let stat = sorter.get_stat(CID);
        assert_eq!(0, stat.lost);
        assert_eq!(0, stat.seqerr_out);
    }
}
