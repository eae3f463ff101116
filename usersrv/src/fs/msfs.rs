//! MSFS (Mailslot File System)
//!
//! Mailslots provide a simple one-way IPC mechanism:
//! - Unidirectional (the creator reads, any number of clients write)
//! - Datagrams (message-based)
//! - Exclusively single-reader: a name can only be created once
//!
//! Mailslots are accessed via `\Device\MailSlot\<mailslotname>`.
//!
//! # Datagram Channel
//!
//! Each named mailslot owns a local datagram socket pair. The write end is
//! shut down for reading and duplicated for every writer; the read end
//! belongs to the mailslot. Writers keep their mailslot alive; once the last
//! reference goes the write end is shut down and the name released.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `base/fs/msfs/create.c`
//! - `base/fs/msfs/read.c`

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::unix::net::UnixDatagram;
use std::sync::{Arc, Weak};

use crate::config::MsfsConfig;
use crate::ke::{DeadlineId, DeadlineQueue, Ticks};
use crate::ob::access::{file_access::*, file_share::*, generic_rights::*, AccessMask};
use crate::ob::obj_attributes::OBJ_OPENIF;
use crate::ob::{AccessMappable, Handle, HandleTable, Nameable, Namespace, Object, ObjectKind, PollEvents, Pollable};
use crate::status::{NtResult, NtStatus};
use crate::win32k::ProcessId;

/// Read timeout meaning "wait for data as long as it takes"
pub const MAILSLOT_WAIT_FOREVER: u32 = 0xFFFF_FFFF;

/// `set_mailslot_info` flag: update the read timeout
pub const MAILSLOT_SET_READ_TIMEOUT: u32 = 0x0001;

/// Open option: synchronous I/O, not alertable
pub const FILE_SYNCHRONOUS_IO_NONALERT: u32 = 0x0000_0020;

/// Rights that only make sense on the read side
const READ_ONLY_RIGHTS: AccessMask = FILE_READ_DATA | FILE_READ_EA | FILE_READ_ATTRIBUTES;
/// Rights that only make sense on the write side
const WRITE_ONLY_RIGHTS: AccessMask = FILE_WRITE_DATA | FILE_APPEND_DATA | FILE_WRITE_EA | FILE_WRITE_ATTRIBUTES;

// ============================================================================
// Mailslot
// ============================================================================

/// Writer linked to a mailslot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriterLink {
    id: u64,
    access: AccessMask,
    sharing: u32,
}

#[derive(Debug)]
struct MailslotState {
    /// Largest datagram accepted (0 = no limit)
    max_msgsize: u32,
    /// Read timeout in milliseconds (0 = none)
    read_timeout: u32,
    /// Size cap used when `max_msgsize` is 0
    datagram_limit: usize,
    /// Write end, shut down for reading; duplicated for writers
    write_end: Option<UnixDatagram>,
    /// Read end
    read_end: Option<UnixDatagram>,
    /// Datagrams pulled off the read end, oldest first
    staged: VecDeque<Vec<u8>>,
    /// Most recently opened first
    writers: Vec<WriterLink>,
    next_writer_id: u64,
}

impl MailslotState {
    fn size_limit(&self) -> usize {
        if self.max_msgsize != 0 {
            self.max_msgsize as usize
        } else {
            self.datagram_limit
        }
    }

    /// Move every datagram waiting on the socket into the staging queue
    fn pump(&mut self) -> NtResult<()> {
        let Some(read_end) = self.read_end.as_ref() else {
            return Ok(());
        };
        loop {
            let mut buf = vec![0; self.datagram_limit];
            match read_end.recv(&mut buf) {
                Ok(len) => {
                    buf.truncate(len);
                    self.staged.push_back(buf);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Mailslot current limits and contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailslotInfo {
    pub max_msgsize: u32,
    pub read_timeout: u32,
    /// Size of the next datagram, if any
    pub next_size: Option<usize>,
    /// Datagrams waiting
    pub message_count: usize,
}

/// Read side of a mailslot
#[derive(Debug)]
pub struct Mailslot {
    /// Name under the device (None for anonymous mailslots)
    name: Option<String>,
    device: Weak<MailslotDevice>,
    state: spin::Mutex<MailslotState>,
}

impl Mailslot {
    fn with_channel(
        name: Option<&str>,
        device: Weak<MailslotDevice>,
        max_msgsize: u32,
        read_timeout: u32,
        datagram_limit: usize,
        channel: Option<(UnixDatagram, UnixDatagram)>,
    ) -> Self {
        let (write_end, read_end) = channel.unzip();
        Self {
            name: name.map(String::from),
            device,
            state: spin::Mutex::new(MailslotState {
                max_msgsize,
                read_timeout,
                datagram_limit,
                write_end,
                read_end,
                staged: VecDeque::new(),
                writers: Vec::new(),
                next_writer_id: 1,
            }),
        }
    }

    /// Mailslot with no name and no datagram channel
    fn anonymous(max_msgsize: u32, read_timeout: u32, datagram_limit: usize) -> Self {
        Self::with_channel(None, Weak::new(), max_msgsize, read_timeout, datagram_limit, None)
    }

    /// Named mailslot with a fresh datagram pair
    fn named(
        name: &str,
        device: Weak<MailslotDevice>,
        max_msgsize: u32,
        read_timeout: u32,
        datagram_limit: usize,
    ) -> NtResult<Self> {
        let (write_end, read_end) = UnixDatagram::pair()?;
        write_end.set_nonblocking(true)?;
        read_end.set_nonblocking(true)?;
        write_end.shutdown(Shutdown::Read)?;

        Ok(Self::with_channel(
            Some(name),
            device,
            max_msgsize,
            read_timeout,
            datagram_limit,
            Some((write_end, read_end)),
        ))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn read_timeout(&self) -> u32 {
        self.state.lock().read_timeout
    }

    pub fn writer_count(&self) -> usize {
        self.state.lock().writers.len()
    }

    pub fn info(&self) -> NtResult<MailslotInfo> {
        let mut state = self.state.lock();
        state.pump()?;
        Ok(MailslotInfo {
            max_msgsize: state.max_msgsize,
            read_timeout: state.read_timeout,
            next_size: state.staged.front().map(Vec::len),
            message_count: state.staged.len(),
        })
    }

    /// Open a writer on this mailslot
    ///
    /// Read sharing must always be requested. With writers already open,
    /// anyone asking for (or holding) write access needs every party to
    /// have agreed to share writing.
    pub fn open_writer(self: &Arc<Self>, access: AccessMask, sharing: u32, options: u32) -> NtResult<MailWriter> {
        let mut state = self.state.lock();
        if sharing & FILE_SHARE_READ == 0 {
            return Err(NtStatus::SharingViolation);
        }
        let wants_write = access & (GENERIC_WRITE | FILE_WRITE_DATA) != 0;
        let conflict = state.writers.iter().any(|w| {
            (wants_write || w.access & FILE_WRITE_DATA != 0)
                && !(sharing & FILE_SHARE_WRITE != 0 && w.sharing & FILE_SHARE_WRITE != 0)
        });
        if conflict {
            log::debug!("[MSFS] Sharing violation opening {:?}", self.name);
            return Err(NtStatus::SharingViolation);
        }

        let socket = state.write_end.as_ref().ok_or(NtStatus::InvalidHandle)?.try_clone()?;
        let id = state.next_writer_id;
        state.next_writer_id += 1;
        let access = writer_map_access(access);
        state.writers.insert(0, WriterLink { id, access, sharing });

        Ok(MailWriter {
            id,
            mailslot: Arc::clone(self),
            socket,
            access,
            sharing,
            options,
        })
    }

    /// Take the next datagram
    ///
    /// `Pending` when nothing is waiting; `BufferTooSmall` leaves the
    /// datagram queued.
    pub fn read(&self, max_size: usize) -> NtResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.pump()?;
        match state.staged.front() {
            None => Err(NtStatus::Pending),
            Some(next) if next.len() > max_size => Err(NtStatus::BufferTooSmall),
            Some(_) => state.staged.pop_front().ok_or(NtStatus::Pending),
        }
    }
}

impl Drop for Mailslot {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(write_end) = state.write_end.take() {
            if let Err(err) = write_end.shutdown(Shutdown::Both) {
                log::debug!("[MSFS] Shutting down {:?} failed: {}", self.name, err);
            }
        }
        if let Some(device) = self.device.upgrade() {
            device.mailslots.lock().retain(|m| m.strong_count() > 0);
        }
        log::debug!("[MSFS] Mailslot {:?} destroyed", self.name);
    }
}

impl Object for Mailslot {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Mailslot
    }

    fn dump(&self) -> String {
        let state = self.state.lock();
        format!(
            "Mailslot {:?} max_msgsize={} read_timeout={} writers={} staged={}",
            self.name,
            state.max_msgsize,
            state.read_timeout,
            state.writers.len(),
            state.staged.len()
        )
    }
}

impl Pollable for Mailslot {
    fn poll_events(&self) -> PollEvents {
        let mut state = self.state.lock();
        if state.pump().is_err() {
            return PollEvents::POLLERR;
        }
        if state.staged.is_empty() {
            PollEvents::empty()
        } else {
            PollEvents::POLLIN
        }
    }
}

impl Nameable for Mailslot {
    fn object_name(&self) -> Option<&str> {
        self.name()
    }
}

impl AccessMappable for Mailslot {
    /// Mailslots can only be read
    fn map_access(&self, access: AccessMask) -> AccessMask {
        let mut access = access;
        if access & (GENERIC_READ | GENERIC_ALL) != 0 {
            access |= FILE_GENERIC_READ;
        }
        access & !(GENERIC_MASK | WRITE_ONLY_RIGHTS | FILE_EXECUTE)
    }
}

// ============================================================================
// Mail Writer
// ============================================================================

/// Writers can only be written to
fn writer_map_access(access: AccessMask) -> AccessMask {
    let mut access = access;
    if access & (GENERIC_WRITE | GENERIC_ALL) != 0 {
        access |= FILE_GENERIC_WRITE;
    }
    access & !(GENERIC_MASK | READ_ONLY_RIGHTS | FILE_EXECUTE)
}

/// Write side of a mailslot, one per opener
#[derive(Debug)]
pub struct MailWriter {
    id: u64,
    mailslot: Arc<Mailslot>,
    /// Duplicate of the mailslot's write end
    socket: UnixDatagram,
    access: AccessMask,
    sharing: u32,
    options: u32,
}

impl MailWriter {
    pub fn access(&self) -> AccessMask {
        self.access
    }

    pub fn sharing(&self) -> u32 {
        self.sharing
    }

    pub fn mailslot(&self) -> &Arc<Mailslot> {
        &self.mailslot
    }

    /// Send one datagram
    pub fn write(&self, data: &[u8]) -> NtResult<usize> {
        let limit = self.mailslot.state.lock().size_limit();
        if data.len() > limit {
            return Err(NtStatus::InvalidParameter);
        }
        let sent = self.socket.send(data)?;
        log::trace!("[MSFS] Writer {} sent {} bytes", self.id, sent);
        Ok(sent)
    }
}

impl Drop for MailWriter {
    fn drop(&mut self) {
        let id = self.id;
        self.mailslot.state.lock().writers.retain(|w| w.id != id);
    }
}

impl Object for MailWriter {
    fn kind(&self) -> ObjectKind {
        ObjectKind::MailWriter
    }

    fn dump(&self) -> String {
        format!(
            "MailWriter {} on {:?} access={:#x} sharing={:#x} options={:#x}",
            self.id, self.mailslot.name, self.access, self.sharing, self.options
        )
    }
}

impl AccessMappable for MailWriter {
    fn map_access(&self, access: AccessMask) -> AccessMask {
        writer_map_access(access)
    }
}

// ============================================================================
// Mailslot Device
// ============================================================================

/// Namespace root for named mailslots
#[derive(Debug)]
pub struct MailslotDevice {
    path: String,
    /// Mailslots by name, ignoring case
    mailslots: spin::Mutex<Namespace<Weak<Mailslot>>>,
}

impl MailslotDevice {
    pub fn new(path: &str) -> Self {
        Self {
            path: String::from(path),
            mailslots: spin::Mutex::new(Namespace::new()),
        }
    }

    /// Find a live mailslot by name
    pub fn lookup_name(&self, name: &str) -> Option<Arc<Mailslot>> {
        self.mailslots.lock().lookup(name).and_then(Weak::upgrade)
    }

    /// Names of live mailslots
    pub fn names(&self) -> Vec<String> {
        let names = self.mailslots.lock();
        names.names().map(String::from).collect()
    }

    fn create_mailslot(
        self: &Arc<Self>,
        name: &str,
        attributes: u32,
        max_msgsize: u32,
        read_timeout: u32,
        datagram_limit: usize,
    ) -> NtResult<Arc<Mailslot>> {
        if self.lookup_name(name).is_some() {
            // There can only be one mailslot to read from
            return Err(if attributes & OBJ_OPENIF != 0 {
                NtStatus::ObjectNameExists
            } else {
                NtStatus::ObjectNameCollision
            });
        }

        // Declared before the lock so a failed insert drops it unlocked
        let mailslot = Arc::new(Mailslot::named(
            name,
            Arc::downgrade(self),
            max_msgsize,
            read_timeout,
            datagram_limit,
        )?);
        let mut names = self.mailslots.lock();
        names.retain(|m| m.strong_count() > 0);
        names.insert(name, Arc::downgrade(&mailslot))?;
        drop(names);

        log::debug!("[MSFS] Created mailslot '{}'", name);
        Ok(mailslot)
    }
}

impl Object for MailslotDevice {
    fn kind(&self) -> ObjectKind {
        ObjectKind::MailslotDevice
    }

    fn dump(&self) -> String {
        format!("MailslotDevice {} ({} names)", self.path, self.mailslots.lock().len())
    }
}

impl Nameable for MailslotDevice {
    fn object_name(&self) -> Option<&str> {
        Some(&self.path)
    }
}

// ============================================================================
// File System
// ============================================================================

/// Object referenced by a mailslot handle
#[derive(Debug, Clone)]
pub enum MsfsObject {
    Mailslot(Arc<Mailslot>),
    Writer(Arc<MailWriter>),
    Device(Arc<MailslotDevice>),
}

impl MsfsObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            MsfsObject::Mailslot(m) => m.kind(),
            MsfsObject::Writer(w) => w.kind(),
            MsfsObject::Device(d) => d.kind(),
        }
    }
}

/// Identifies an asynchronous read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncId(u64);

#[derive(Debug)]
struct PendingRead {
    id: AsyncId,
    mailslot: Arc<Mailslot>,
    max_size: usize,
    deadline: Option<DeadlineId>,
}

/// Outcome of an asynchronous read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCompletion {
    pub id: AsyncId,
    pub status: NtResult<Vec<u8>>,
}

/// The mailslot file system: device namespace, per-process handles and
/// pending reads
#[derive(Debug)]
pub struct MailslotFs {
    config: MsfsConfig,
    /// Object directory holding the device
    root: Namespace<Arc<MailslotDevice>>,
    device: Arc<MailslotDevice>,
    handles: HashMap<ProcessId, HandleTable<MsfsObject>>,
    deadlines: DeadlineQueue<AsyncId>,
    /// Pending reads, oldest first
    reads: Vec<PendingRead>,
    next_async: u64,
}

impl MailslotFs {
    pub fn new(config: MsfsConfig) -> NtResult<Self> {
        let device = Arc::new(MailslotDevice::new(&config.device_path));
        let mut root = Namespace::new();
        root.insert(&config.device_path, Arc::clone(&device))?;
        log::debug!("[MSFS] Device registered at {}", config.device_path);
        Ok(Self {
            config,
            root,
            device,
            handles: HashMap::new(),
            deadlines: DeadlineQueue::new(),
            reads: Vec::new(),
            next_async: 0,
        })
    }

    pub fn device(&self) -> &Arc<MailslotDevice> {
        &self.device
    }

    pub fn now(&self) -> Ticks {
        self.deadlines.now()
    }

    fn table(&mut self, process: ProcessId) -> &mut HandleTable<MsfsObject> {
        self.handles.entry(process).or_default()
    }

    fn reference(&self, process: ProcessId, handle: Handle, access: AccessMask) -> NtResult<&MsfsObject> {
        self.handles
            .get(&process)
            .ok_or(NtStatus::InvalidHandle)?
            .reference(handle, access)
    }

    fn mailslot(&self, process: ProcessId, handle: Handle, access: AccessMask) -> NtResult<Arc<Mailslot>> {
        match self.reference(process, handle, access)? {
            MsfsObject::Mailslot(mailslot) => Ok(Arc::clone(mailslot)),
            _ => Err(NtStatus::ObjectTypeMismatch),
        }
    }

    /// Resolve a path to the device and the name below it
    fn resolve<'p>(&self, path: &'p str) -> Option<(Arc<MailslotDevice>, &'p str)> {
        self.root
            .find_prefix(path)
            .map(|(device, rest)| (Arc::clone(device), rest))
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Create the read side of a mailslot
    ///
    /// An empty path creates an anonymous mailslot nobody can open.
    pub fn create_mailslot(
        &mut self,
        process: ProcessId,
        path: &str,
        attributes: u32,
        access: AccessMask,
        max_msgsize: u32,
        read_timeout: u32,
    ) -> NtResult<Handle> {
        let limit = self.config.max_datagram_size;
        let mailslot = if path.is_empty() {
            Arc::new(Mailslot::anonymous(max_msgsize, read_timeout, limit))
        } else {
            let (device, name) = self.resolve(path).ok_or(NtStatus::ObjectNameInvalid)?;
            if name.is_empty() {
                // The path names the device itself
                return Err(if attributes & OBJ_OPENIF != 0 {
                    NtStatus::ObjectTypeMismatch
                } else {
                    NtStatus::ObjectNameCollision
                });
            }
            device.create_mailslot(name, attributes, max_msgsize, read_timeout, limit)?
        };

        let granted = mailslot.map_access(access);
        self.table(process)
            .create_handle(MsfsObject::Mailslot(mailslot), granted, attributes)
    }

    /// Open a writer on a named mailslot, or the device itself
    pub fn open_mailslot(
        &mut self,
        process: ProcessId,
        path: &str,
        access: AccessMask,
        sharing: u32,
        options: u32,
    ) -> NtResult<Handle> {
        let (device, name) = self.resolve(path).ok_or(NtStatus::ObjectNameNotFound)?;
        let (object, granted) = if name.is_empty() {
            (MsfsObject::Device(device), access)
        } else {
            let mailslot = device.lookup_name(name).ok_or(NtStatus::ObjectNameNotFound)?;
            let writer = mailslot.open_writer(access, sharing, options)?;
            let granted = writer.access();
            (MsfsObject::Writer(Arc::new(writer)), granted)
        };
        self.table(process).create_handle(object, granted, 0)
    }

    /// Update the read timeout (with `MAILSLOT_SET_READ_TIMEOUT`) and
    /// report the current limits
    pub fn set_mailslot_info(
        &mut self,
        process: ProcessId,
        handle: Handle,
        flags: u32,
        read_timeout: u32,
    ) -> NtResult<MailslotInfo> {
        let mailslot = self.mailslot(process, handle, 0)?;
        if flags & MAILSLOT_SET_READ_TIMEOUT != 0 {
            mailslot.state.lock().read_timeout = read_timeout;
        }
        mailslot.info()
    }

    pub fn write(&mut self, process: ProcessId, handle: Handle, data: &[u8]) -> NtResult<usize> {
        match self.reference(process, handle, FILE_WRITE_DATA)? {
            MsfsObject::Writer(writer) => writer.write(data),
            _ => Err(NtStatus::ObjectTypeMismatch),
        }
    }

    pub fn read(&mut self, process: ProcessId, handle: Handle, max_size: usize) -> NtResult<Vec<u8>> {
        self.mailslot(process, handle, FILE_READ_DATA)?.read(max_size)
    }

    pub fn is_signaled(&self, process: ProcessId, handle: Handle) -> NtResult<bool> {
        Ok(self.mailslot(process, handle, 0)?.is_signaled())
    }

    /// Queue a read that completes on data or when the read timeout runs
    /// out
    ///
    /// The request itself is pending; the outcome is reported by
    /// [`MailslotFs::poll_reads`] or [`MailslotFs::advance_time`].
    pub fn queue_async_read(&mut self, process: ProcessId, handle: Handle, max_size: usize) -> NtResult<AsyncId> {
        let mailslot = self.mailslot(process, handle, FILE_READ_DATA)?;
        self.next_async += 1;
        let id = AsyncId(self.next_async);

        let timeout = mailslot.read_timeout();
        let deadline = if timeout != 0 && timeout != MAILSLOT_WAIT_FOREVER {
            Some(self.deadlines.arm_after(u64::from(timeout), id))
        } else {
            None
        };
        self.reads.push(PendingRead {
            id,
            mailslot,
            max_size,
            deadline,
        });
        log::trace!("[MSFS] Queued read {:?} (timeout {}ms)", id, timeout);
        Ok(id)
    }

    /// Complete pending reads that have data
    pub fn poll_reads(&mut self) -> Vec<AsyncCompletion> {
        let mut done = Vec::new();
        let mut index = 0;
        while index < self.reads.len() {
            let read = &self.reads[index];
            match read.mailslot.read(read.max_size) {
                Err(NtStatus::Pending) => index += 1,
                status => {
                    let read = self.reads.remove(index);
                    if let Some(deadline) = read.deadline {
                        self.deadlines.cancel(deadline);
                    }
                    done.push(AsyncCompletion { id: read.id, status });
                }
            }
        }
        done
    }

    /// Advance the clock; reads still waiting when their timeout expires
    /// fail with `IoTimeout`
    pub fn advance_time(&mut self, ms: u64) -> Vec<AsyncCompletion> {
        let mut done = self.poll_reads();
        self.deadlines.advance_by(ms);
        while let Some((_, id)) = self.deadlines.pop_expired() {
            if let Some(pos) = self.reads.iter().position(|r| r.id == id) {
                self.reads.remove(pos);
                log::debug!("[MSFS] Read {:?} timed out", id);
                done.push(AsyncCompletion {
                    id,
                    status: Err(NtStatus::IoTimeout),
                });
            }
        }
        done
    }

    pub fn close_handle(&mut self, process: ProcessId, handle: Handle) -> NtResult<()> {
        let table = self.handles.get_mut(&process).ok_or(NtStatus::InvalidHandle)?;
        let object = table.close_handle(handle)?;
        log::trace!("[MSFS] Closed {} handle {:#x}", object.kind().type_name(), handle);
        Ok(())
    }

    /// Drop every handle of an exiting process
    pub fn close_process(&mut self, process: ProcessId) {
        if let Some(table) = self.handles.remove(&process) {
            log::debug!("[MSFS] Process {} closed {} handles", process.0, table.count());
        }
    }

    /// Kind of the object behind a handle
    pub fn handle_kind(&self, process: ProcessId, handle: Handle) -> NtResult<ObjectKind> {
        self.reference(process, handle, 0).map(MsfsObject::kind)
    }

    pub fn granted_access(&self, process: ProcessId, handle: Handle) -> NtResult<AccessMask> {
        self.handles
            .get(&process)
            .ok_or(NtStatus::InvalidHandle)?
            .granted_access(handle)
    }
}
