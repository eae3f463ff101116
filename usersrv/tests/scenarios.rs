//! End-to-end request sequences across queues, inputs and mailslots

use usersrv::fs::msfs::{AsyncCompletion, MAILSLOT_SET_READ_TIMEOUT};
use usersrv::ob::access::{file_share::*, generic_rights::*};
use usersrv::ob::obj_attributes::OBJ_OPENIF;
use usersrv::win32k::user::message::{
    GetMessageRequest, HardwareInput, MessageType, QueueStatus, SendMessageRequest, WM_LBUTTONDOWN, WM_MOUSEMOVE,
    WM_TIMER, WM_USER,
};
use usersrv::win32k::{DesktopId, ProcessId, Rect, ThreadId, HWND};
use usersrv::{MailslotFs, MsfsConfig, NtStatus, UserConfig, UserServer};

const A: ThreadId = ThreadId(10);
const B: ThreadId = ThreadId(20);
const DESK: DesktopId = DesktopId(1);

fn two_threads() -> UserServer {
    let mut server = UserServer::new(UserConfig::default());
    for tid in [A, B] {
        server.register_thread(tid, ProcessId(1), DESK).unwrap();
        server.create_message_queue(tid, None).unwrap();
    }
    server
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn timer_catches_up_after_missed_periods() {
    let mut server = two_threads();
    let win = server
        .windows_mut()
        .create_window(A, DESK, HWND::NULL, Rect::new(0, 0, 100, 100))
        .unwrap();
    assert_eq!(server.set_window_timer(A, win, WM_TIMER, 1, 100, 0), Ok(1));

    server.advance_time(250);
    assert!(server.queue(A).unwrap().wake_bits().contains(QueueStatus::TIMER));

    let timers = GetMessageRequest::new().filter(QueueStatus::TIMER);
    let reply = server.get_message(A, &timers).unwrap();
    assert_eq!((reply.win, reply.msg, reply.wparam), (win, WM_TIMER, 1));

    // Only one event, however many periods were missed
    assert_eq!(server.get_message(A, &timers), Err(NtStatus::Pending));

    let now = server.now();
    let queue = server.queue(A).unwrap();
    let next = queue.timers().pending().next().unwrap();
    assert!(next.when >= now + 100);
    assert!(!queue.wake_bits().contains(QueueStatus::TIMER));
}

#[test]
fn timer_peek_leaves_it_expired() {
    let mut server = two_threads();
    let win = server.windows_mut().create_window(A, DESK, HWND::NULL, Rect::EMPTY).unwrap();
    server.set_window_timer(A, win, WM_TIMER, 7, 30, 5).unwrap();
    server.advance_time(30);

    let peek = GetMessageRequest::new().filter(QueueStatus::TIMER).no_remove();
    let reply = server.get_message(A, &peek).unwrap();
    assert_eq!((reply.wparam, reply.lparam), (7, 5));
    assert!(server.queue(A).unwrap().timers().has_expired());
    assert!(server.get_message(A, &peek).is_ok());
}

// ============================================================================
// Send / Reply
// ============================================================================

#[test]
fn send_reply_ping_pong() {
    let mut server = two_threads();
    let req = SendMessageRequest::new(B, MessageType::Unicode, HWND::NULL, WM_USER).data(&b"ping"[..]);
    server.send_message(A, req).unwrap();
    assert_eq!(server.collect_send_reply(A, false, 64), Err(NtStatus::Pending));

    let received = server.get_message(B, &GetMessageRequest::new()).unwrap();
    assert_eq!(received.msg_type, MessageType::Unicode);
    assert_eq!(received.data, b"ping");

    server.reply_to_current_message(B, 0, None, true, b"pong").unwrap();
    assert!(server.queue(A).unwrap().wake_bits().contains(QueueStatus::SMRESULT));

    let reply = server.collect_send_reply(A, false, 64).unwrap();
    assert_eq!(reply.data, b"pong");
    assert_eq!(reply.result, 0);
    assert!(server.results().is_empty());
    assert!(!server.queue(A).unwrap().wake_bits().contains(QueueStatus::SMRESULT));
}

#[test]
fn reply_larger_than_buffer_stays_available() {
    let mut server = two_threads();
    let req = SendMessageRequest::new(B, MessageType::Unicode, HWND::NULL, WM_USER);
    server.send_message(A, req).unwrap();
    server.get_message(B, &GetMessageRequest::new()).unwrap();
    server.reply_to_current_message(B, 9, None, true, b"a long answer").unwrap();

    assert_eq!(server.collect_send_reply(A, false, 4), Err(NtStatus::BufferOverflow));
    let reply = server.collect_send_reply(A, false, 64).unwrap();
    assert_eq!((reply.result, reply.data.as_slice()), (9, &b"a long answer"[..]));
}

#[test]
fn callback_completion_comes_back_as_sent_message() {
    let mut server = two_threads();
    let req = SendMessageRequest::new(B, MessageType::Callback, HWND::NULL, WM_USER + 3).data(&b"cookie"[..]);
    server.send_message(A, req).unwrap();

    let received = server.get_message(B, &GetMessageRequest::new()).unwrap();
    assert_eq!(received.msg, WM_USER + 3);
    assert!(received.data.is_empty());
    server.reply_to_current_message(B, 42, None, true, &[]).unwrap();

    let completion = server.get_message(A, &GetMessageRequest::new()).unwrap();
    assert_eq!(completion.msg_type, MessageType::CallbackResult);
    assert_eq!((completion.msg, completion.lparam), (WM_USER + 3, 42));
    assert_eq!(completion.data, b"cookie");
    assert!(server.results().is_empty());
}

#[test]
fn unreceived_send_times_out() {
    let mut server = two_threads();
    let req = SendMessageRequest::new(B, MessageType::Unicode, HWND::NULL, WM_USER).timeout(100);
    server.send_message(A, req).unwrap();

    server.advance_time(99);
    assert_eq!(server.collect_send_reply(A, false, 64), Err(NtStatus::Pending));
    server.advance_time(1);
    assert_eq!(server.collect_send_reply(A, false, 64), Err(NtStatus::Timeout));

    // The message was pulled back out of the receiver
    assert_eq!(server.get_message(B, &GetMessageRequest::new()), Err(NtStatus::Pending));
    assert!(server.results().is_empty());
}

#[test]
fn cancelled_send_still_reaches_receiver() {
    let mut server = two_threads();
    let req = SendMessageRequest::new(B, MessageType::Unicode, HWND::NULL, WM_USER);
    server.send_message(A, req).unwrap();
    assert_eq!(server.collect_send_reply(A, true, 64), Err(NtStatus::Cancelled));

    server.get_message(B, &GetMessageRequest::new()).unwrap();
    server.reply_to_current_message(B, 1, None, true, &[]).unwrap();
    assert!(server.results().is_empty());
}

#[test]
fn receiver_exit_fails_outstanding_send() {
    let mut server = two_threads();
    let req = SendMessageRequest::new(B, MessageType::Unicode, HWND::NULL, WM_USER);
    server.send_message(A, req).unwrap();
    server.get_message(B, &GetMessageRequest::new()).unwrap();

    server.destroy_queue_on_thread_exit(B);
    assert_eq!(server.collect_send_reply(A, false, 64), Err(NtStatus::AccessDenied));
    assert!(server.results().is_empty());
}

// ============================================================================
// Hardware Input
// ============================================================================

#[test]
fn mouse_moves_merge() {
    let mut server = two_threads();
    let win = server
        .windows_mut()
        .create_window(A, DESK, HWND::NULL, Rect::new(0, 0, 100, 100))
        .unwrap();
    server.windows_mut().set_visible(win, true);

    let first = HardwareInput::new(win, WM_MOUSEMOVE, 0, 0).at(10, 10).time(5);
    let second = HardwareInput::new(win, WM_MOUSEMOVE, 0, 0).at(20, 25).time(9);
    server.send_hardware_message(Some(A), first).unwrap();
    server.send_hardware_message(Some(A), second).unwrap();
    assert_eq!(server.thread_input(A).unwrap().hardware_messages().count(), 1);
    assert_eq!(server.get_last_input_time(), 0);

    let reply = server.get_message(A, &GetMessageRequest::new()).unwrap();
    assert_eq!(reply.msg_type, MessageType::Hardware);
    assert_eq!((reply.win, reply.msg), (win, WM_MOUSEMOVE));
    assert_eq!((reply.pt.x, reply.pt.y, reply.time), (20, 25, 9));
    assert_ne!(reply.hw_id, 0);

    server.accept_hardware_message(A, reply.hw_id, true, HWND::NULL).unwrap();
    assert_eq!(server.thread_input(A).unwrap().hardware_messages().count(), 0);
    assert!(!server.queue(A).unwrap().wake_bits().contains(QueueStatus::MOUSEMOVE));
}

#[test]
fn moves_only_merge_with_the_last_message() {
    let mut server = two_threads();
    let win = server
        .windows_mut()
        .create_window(A, DESK, HWND::NULL, Rect::new(0, 0, 100, 100))
        .unwrap();
    server.windows_mut().set_visible(win, true);

    for msg in [WM_MOUSEMOVE, WM_MOUSEMOVE, WM_LBUTTONDOWN, WM_MOUSEMOVE] {
        server
            .send_hardware_message(Some(A), HardwareInput::new(win, msg, 0, 0).at(5, 5))
            .unwrap();
    }
    let codes: Vec<u32> = server.thread_input(A).unwrap().hardware_messages().map(|m| m.msg).collect();
    assert_eq!(codes, vec![WM_MOUSEMOVE, WM_LBUTTONDOWN, WM_MOUSEMOVE]);
}

#[test]
fn attach_then_detach_input() {
    let mut server = two_threads();
    let win = server.windows_mut().create_window(B, DESK, HWND::NULL, Rect::EMPTY).unwrap();
    server.set_focus_window(B, win).unwrap();
    server.set_capture_window(B, win, 0).unwrap();
    server.set_key_state(A, &[0x80; 16]).unwrap();

    server.attach_thread_input(A, B).unwrap();
    assert_eq!(server.queue(A).unwrap().input(), server.queue(B).unwrap().input());
    assert_eq!(server.inputs().len(), 1);
    // A now sees B's focus
    assert_eq!(server.get_thread_input_state(Some(A)).unwrap().focus, win);

    server.detach_thread_input(A, B).unwrap();
    assert_ne!(server.queue(A).unwrap().input(), server.queue(B).unwrap().input());

    let b_state = server.get_thread_input_state(Some(B)).unwrap();
    assert_eq!((b_state.focus, b_state.capture), (win, win));
    let a_state = server.get_thread_input_state(Some(A)).unwrap();
    assert_eq!((a_state.focus, a_state.capture), (HWND::NULL, HWND::NULL));
    assert!(server.get_key_state(A, None).unwrap().keystate.iter().all(|&k| k == 0));
}

#[test]
fn attach_across_desktops_is_denied() {
    let mut server = two_threads();
    let c = ThreadId(30);
    server.register_thread(c, ProcessId(1), DesktopId(2)).unwrap();
    assert_eq!(server.attach_thread_input(c, A), Err(NtStatus::AccessDenied));
    assert_eq!(server.detach_thread_input(A, B), Err(NtStatus::AccessDenied));
}

// ============================================================================
// Mailslots
// ============================================================================

#[test]
fn mailslot_single_reader_many_writers() {
    let mut fs = MailslotFs::new(MsfsConfig::default()).unwrap();
    let reader = ProcessId(1);
    let client = ProcessId(2);
    let path = "\\Device\\MailSlot\\alerts";

    let slot = fs.create_mailslot(reader, path, 0, GENERIC_READ, 0, 0).unwrap();
    assert_eq!(
        fs.create_mailslot(client, path, OBJ_OPENIF, GENERIC_READ, 0, 0),
        Err(NtStatus::ObjectNameExists)
    );
    assert_eq!(
        fs.open_mailslot(client, path, GENERIC_WRITE, FILE_SHARE_WRITE, 0),
        Err(NtStatus::SharingViolation)
    );

    let share = FILE_SHARE_READ | FILE_SHARE_WRITE;
    let first = fs.open_mailslot(client, path, GENERIC_WRITE, share, 0).unwrap();
    let second = fs.open_mailslot(client, path, GENERIC_WRITE, share, 0).unwrap();
    fs.write(client, first, b"one").unwrap();
    fs.write(client, second, b"two").unwrap();

    assert_eq!(fs.read(reader, slot, 16).unwrap(), b"one");
    assert_eq!(fs.read(reader, slot, 16).unwrap(), b"two");
    assert_eq!(fs.read(reader, slot, 16), Err(NtStatus::Pending));
}

#[test]
fn exclusive_writer_blocks_others() {
    let mut fs = MailslotFs::new(MsfsConfig::default()).unwrap();
    let path = "\\Device\\MailSlot\\exclusive";
    fs.create_mailslot(ProcessId(1), path, 0, GENERIC_READ, 0, 0).unwrap();
    fs.open_mailslot(ProcessId(2), path, GENERIC_WRITE, FILE_SHARE_READ, 0).unwrap();
    assert_eq!(
        fs.open_mailslot(ProcessId(3), path, GENERIC_WRITE, FILE_SHARE_READ | FILE_SHARE_WRITE, 0),
        Err(NtStatus::SharingViolation)
    );
}

#[test]
fn async_read_waits_for_data_or_timeout() {
    let mut fs = MailslotFs::new(MsfsConfig::default()).unwrap();
    let path = "\\Device\\MailSlot\\async";
    let slot = fs.create_mailslot(ProcessId(1), path, 0, GENERIC_READ, 0, 0).unwrap();
    fs.set_mailslot_info(ProcessId(1), slot, MAILSLOT_SET_READ_TIMEOUT, 40).unwrap();
    let writer = fs
        .open_mailslot(ProcessId(2), path, GENERIC_WRITE, FILE_SHARE_READ | FILE_SHARE_WRITE, 0)
        .unwrap();

    let timed_out = fs.queue_async_read(ProcessId(1), slot, 64).unwrap();
    assert_eq!(
        fs.advance_time(40),
        vec![AsyncCompletion { id: timed_out, status: Err(NtStatus::IoTimeout) }]
    );

    let served = fs.queue_async_read(ProcessId(1), slot, 64).unwrap();
    fs.write(ProcessId(2), writer, b"late").unwrap();
    assert_eq!(
        fs.poll_reads(),
        vec![AsyncCompletion { id: served, status: Ok(b"late".to_vec()) }]
    );
    assert!(fs.advance_time(100).is_empty());
}
