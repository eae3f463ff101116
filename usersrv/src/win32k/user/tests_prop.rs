#![cfg(test)]
//! Property tests for queue wake bits, timer ordering and send results
//!
//! - Wake bits: the signaled state always follows the wake/changed masks
//! - Timers: the pending list stays sorted and the armed deadline tracks
//!   its head
//! - Results: every result is freed exactly once whatever the order of
//!   collects, replies, timeouts and queue teardown

use proptest::prelude::*;

use super::super::{DesktopId, ProcessId, Rect, ThreadId, HWND};
use super::message::{GetMessageRequest, MessageType, QueueStatus, SendMessageRequest, INFINITE, WM_TIMER, WM_USER};
use super::queue::MsgQueue;
use super::{InputId, UserServer};
use crate::config::UserConfig;

const SENDER: ThreadId = ThreadId(1);
const RECEIVER: ThreadId = ThreadId(2);

fn arb_bits() -> impl Strategy<Value = QueueStatus> {
    (0u32..0x200).prop_map(QueueStatus::from_bits_truncate)
}

fn two_threads() -> UserServer {
    let mut server = UserServer::new(UserConfig::default());
    for tid in [SENDER, RECEIVER] {
        server.register_thread(tid, ProcessId(1), DesktopId(0)).unwrap();
        server.create_message_queue(tid, None).unwrap();
    }
    server
}

// ============================================================================
// Wake Bits
// ============================================================================

#[derive(Debug, Clone)]
enum BitsOp {
    Set(QueueStatus),
    Clear(QueueStatus),
    Masks(QueueStatus, QueueStatus),
    ClearChanged(QueueStatus),
    WaitSatisfied,
}

fn arb_bits_op() -> impl Strategy<Value = BitsOp> {
    prop_oneof![
        arb_bits().prop_map(BitsOp::Set),
        arb_bits().prop_map(BitsOp::Clear),
        (arb_bits(), arb_bits()).prop_map(|(w, c)| BitsOp::Masks(w, c)),
        arb_bits().prop_map(BitsOp::ClearChanged),
        Just(BitsOp::WaitSatisfied),
    ]
}

proptest! {
    #[test]
    fn signaled_follows_masks(ops in prop::collection::vec(arb_bits_op(), 1..64)) {
        let mut queue = MsgQueue::new(SENDER, ProcessId(1), InputId::from_raw(1), 0x7fff, 0);
        let (mut wake, mut changed) = (QueueStatus::empty(), QueueStatus::empty());
        let (mut wake_mask, mut changed_mask) = (QueueStatus::empty(), QueueStatus::empty());

        for op in ops {
            match op {
                BitsOp::Set(bits) => {
                    queue.set_bits(bits);
                    wake |= bits;
                    changed |= bits;
                }
                BitsOp::Clear(bits) => {
                    queue.clear_bits(bits);
                    wake &= !bits;
                    changed &= !bits;
                }
                BitsOp::Masks(w, c) => {
                    queue.set_masks(w, c);
                    wake_mask = w;
                    changed_mask = c;
                }
                BitsOp::ClearChanged(bits) => {
                    queue.clear_changed(bits);
                    changed &= !bits;
                }
                BitsOp::WaitSatisfied => {
                    queue.wait_satisfied();
                    wake_mask = QueueStatus::empty();
                    changed_mask = QueueStatus::empty();
                }
            }
            prop_assert_eq!(queue.wake_bits(), wake);
            prop_assert_eq!(queue.changed_bits(), changed);
            let expected = wake.intersects(wake_mask) || changed.intersects(changed_mask);
            prop_assert_eq!(queue.satisfied(), expected);
        }
    }
}

// ============================================================================
// Timers
// ============================================================================

#[derive(Debug, Clone)]
enum TimerOp {
    Set { id: usize, rate: u32 },
    Kill(usize),
    Advance(u64),
    Collect { remove: bool },
}

fn arb_timer_op() -> impl Strategy<Value = TimerOp> {
    prop_oneof![
        (1usize..6, 0u32..400).prop_map(|(id, rate)| TimerOp::Set { id, rate }),
        (1usize..6).prop_map(TimerOp::Kill),
        (0u64..300).prop_map(TimerOp::Advance),
        any::<bool>().prop_map(|remove| TimerOp::Collect { remove }),
    ]
}

proptest! {
    #[test]
    fn timers_stay_sorted(ops in prop::collection::vec(arb_timer_op(), 1..64)) {
        let mut server = two_threads();
        let win = server
            .windows_mut()
            .create_window(SENDER, DesktopId(0), HWND::NULL, Rect::EMPTY)
            .unwrap();
        let timer_only = GetMessageRequest::new().filter(QueueStatus::TIMER);

        for op in ops {
            match op {
                TimerOp::Set { id, rate } => {
                    prop_assert_eq!(server.set_window_timer(SENDER, win, WM_TIMER, id, rate, 0), Ok(id));
                }
                TimerOp::Kill(id) => {
                    let _ = server.kill_window_timer(SENDER, win, WM_TIMER, id);
                }
                TimerOp::Advance(ms) => server.advance_time(ms),
                TimerOp::Collect { remove } => {
                    let req = if remove { timer_only.clone() } else { timer_only.clone().no_remove() };
                    if let Ok(reply) = server.get_message(SENDER, &req) {
                        prop_assert_eq!(reply.msg, WM_TIMER);
                        prop_assert_eq!(reply.win, win);
                    }
                }
            }

            let now = server.now();
            let queue = server.queue(SENDER).unwrap();
            let timers = queue.timers();
            prop_assert!(timers.is_sorted());
            let armed = queue.timeout.and_then(|id| server.deadlines.due_time(id));
            prop_assert_eq!(armed, timers.next_due());
            prop_assert!(timers.pending().all(|t| t.when > now));
            prop_assert_eq!(queue.wake_bits().contains(QueueStatus::TIMER), timers.has_expired());
        }
    }
}

// ============================================================================
// Send Results
// ============================================================================

#[derive(Debug, Clone)]
enum SendOp {
    Send { callback: bool, timeout: Option<u32> },
    Receive,
    Reply { remove: bool },
    Collect { cancel: bool },
    DrainSender,
    Advance(u64),
    DestroyReceiver,
}

fn arb_send_op() -> impl Strategy<Value = SendOp> {
    prop_oneof![
        (any::<bool>(), prop::option::of(1u32..200))
            .prop_map(|(callback, timeout)| SendOp::Send { callback, timeout }),
        Just(SendOp::Receive),
        any::<bool>().prop_map(|remove| SendOp::Reply { remove }),
        any::<bool>().prop_map(|cancel| SendOp::Collect { cancel }),
        Just(SendOp::DrainSender),
        (0u64..150).prop_map(SendOp::Advance),
        Just(SendOp::DestroyReceiver),
    ]
}

proptest! {
    #[test]
    fn results_freed_exactly_once(ops in prop::collection::vec(arb_send_op(), 1..48)) {
        let mut server = two_threads();

        for op in ops {
            match op {
                SendOp::Send { callback, timeout } => {
                    let msg_type = if callback { MessageType::Callback } else { MessageType::Unicode };
                    let req = SendMessageRequest::new(RECEIVER, msg_type, HWND::NULL, WM_USER)
                        .data(&b"ping"[..])
                        .timeout(timeout.unwrap_or(INFINITE));
                    let _ = server.send_message(SENDER, req);
                }
                SendOp::Receive => {
                    if server.queue(RECEIVER).is_some() {
                        let _ = server.get_message(RECEIVER, &GetMessageRequest::new());
                    }
                }
                SendOp::Reply { remove } => {
                    let _ = server.reply_to_current_message(RECEIVER, 1, None, remove, b"pong");
                }
                SendOp::Collect { cancel } => {
                    let _ = server.collect_send_reply(SENDER, cancel, 64);
                }
                SendOp::DrainSender => {
                    let _ = server.get_message(SENDER, &GetMessageRequest::new());
                }
                SendOp::Advance(ms) => server.advance_time(ms),
                SendOp::DestroyReceiver => {
                    server.destroy_queue_on_thread_exit(RECEIVER);
                    server.register_thread(RECEIVER, ProcessId(1), DesktopId(0)).unwrap();
                    server.create_message_queue(RECEIVER, None).unwrap();
                }
            }

            let results = server.results();
            prop_assert_eq!(results.allocated(), results.freed() + results.len() as u64);
        }

        server.destroy_queue_on_thread_exit(RECEIVER);
        server.destroy_queue_on_thread_exit(SENDER);
        let results = server.results();
        prop_assert!(results.is_empty());
        prop_assert_eq!(results.allocated(), results.freed());
        prop_assert!(server.inputs().is_empty());
    }
}
