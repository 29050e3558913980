// Cross-domain remoting: domain handles, the fixed-size message record and
// the wire packing dictated by method signatures. Strings are the only heap
// object shared across domains (by reference count); other references cross
// only as foreign-proxy pairs of (domain handle, exported name).

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace};
use skizo_diagnostics::{HostError, HostResult};
use skizo_meta::{Method, PrimType, Registry, SpecialClass};

use crate::strings::{SoStr, StrSlice};
use crate::sync::{MessageQueue, WaitObject};

/// Hard cap on a message's argument buffer.
pub const DOMAIN_MESSAGE_SIZE: usize = 1024;

/// Error text carried back to the caller; `Owned` mirrors the original's
/// free-on-deliver flag.
#[derive(Debug, Clone)]
pub enum ErrorMsg {
    Static(&'static str),
    Owned(String),
}

impl ErrorMsg {
    pub fn text(&self) -> &str {
        match self {
            ErrorMsg::Static(s) => s,
            ErrorMsg::Owned(s) => s,
        }
    }
}

/// The return slot lives inside the reference-counted message, so a caller
/// that timed out leaves the target writing into live memory; the stale
/// reply is simply never read.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetSlot {
    pub bytes: [u8; 16],
    pub written: bool,
}

pub struct DomainMessage {
    pub object_name: Arc<SoStr>,
    /// Backed by a ref-counted buffer, safe across domain boundaries.
    pub method_name: StrSlice,
    /// Borrowed from the sender; pulsed by the target when done.
    pub result_wait: Arc<WaitObject>,
    pub error: Mutex<Option<ErrorMsg>>,
    pub ret: Mutex<RetSlot>,
    pub buffer_len: usize,
    pub buffer: [u8; DOMAIN_MESSAGE_SIZE],
    /// Pins every shared payload referenced from `buffer` raw-pointer-wise.
    retained_strings: Vec<Arc<SoStr>>,
    retained_handles: Vec<Arc<DomainHandle>>,
}

impl DomainMessage {
    pub fn new(object_name: Arc<SoStr>, method_name: StrSlice, result_wait: Arc<WaitObject>) -> Self {
        Self {
            object_name,
            method_name,
            result_wait,
            error: Mutex::new(None),
            ret: Mutex::new(RetSlot::default()),
            buffer_len: 0,
            buffer: [0; DOMAIN_MESSAGE_SIZE],
            retained_strings: Vec::new(),
            retained_handles: Vec::new(),
        }
    }

    pub fn take_error(&self) -> Option<ErrorMsg> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn set_error(&self, error: ErrorMsg) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    pub fn write_ret(&self, bytes: &[u8]) {
        let mut slot = self.ret.lock().unwrap_or_else(|e| e.into_inner());
        let n = bytes.len().min(16);
        slot.bytes[..n].copy_from_slice(&bytes[..n]);
        slot.written = true;
    }

    pub fn read_ret(&self) -> RetSlot {
        *self.ret.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub type DomainQueue = MessageQueue<Arc<DomainMessage>>;

// ----------------------------------------------------------------------
// Wire packing. The buffer layout is dictated by the method signature:
// primitives in natural width, strings as pointers to the shared immutable
// buffer, foreign references as (handle, name) pointer pairs, reference-
// free value types by content.
// ----------------------------------------------------------------------

/// A value as the sender sees it.
#[derive(Debug, Clone)]
pub enum SendValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Char(u16),
    Str(Arc<SoStr>),
    Proxy {
        handle: Arc<DomainHandle>,
        name: Arc<SoStr>,
    },
    Bytes(Vec<u8>),
    Null,
}

/// A value as the receiver decodes it.
#[derive(Debug, Clone)]
pub enum RecvValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Char(u16),
    Str(Arc<SoStr>),
    Proxy {
        handle: Arc<DomainHandle>,
        name: Arc<SoStr>,
    },
    Bytes(Vec<u8>),
    Null,
}

fn align_to(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

fn put<const N: usize>(buffer: &mut [u8], offset: usize, bytes: [u8; N]) -> HostResult<usize> {
    let end = offset + N;
    if end > buffer.len() {
        return Err(HostError::OutOfRange(
            "domain message buffer overflow".into(),
        ));
    }
    buffer[offset..end].copy_from_slice(&bytes);
    Ok(end)
}

/// Packs arguments into the message buffer. The message retains the shared
/// payloads so raw pointers inside the buffer stay valid for its lifetime.
pub fn pack_args(
    registry: &Registry,
    method: &Method,
    args: &[SendValue],
    msg: &mut DomainMessage,
) -> HostResult<()> {
    if args.len() != method.sig.params.len() {
        return Err(HostError::IllegalArgument(format!(
            "{} expects {} arguments, got {}",
            method.name,
            method.sig.params.len(),
            args.len()
        )));
    }

    let mut offset = 0usize;
    for (param, arg) in method.sig.params.iter().zip(args.iter()) {
        let param_class = param.ty.resolved.map(|id| registry.class(id));
        offset = match (param.ty.prim, arg) {
            (PrimType::Int, SendValue::Int(v)) => {
                let at = align_to(offset, 4);
                put(&mut msg.buffer, at, v.to_ne_bytes())?
            }
            (PrimType::Float, SendValue::Float(v)) => {
                let at = align_to(offset, 4);
                put(&mut msg.buffer, at, v.to_ne_bytes())?
            }
            (PrimType::Bool, SendValue::Bool(v)) => {
                let at = align_to(offset, 4);
                put(&mut msg.buffer, at, (*v as i32).to_ne_bytes())?
            }
            (PrimType::Char, SendValue::Char(v)) => {
                let at = align_to(offset, 2);
                put(&mut msg.buffer, at, v.to_ne_bytes())?
            }
            (PrimType::Object, SendValue::Str(s)) => {
                let at = align_to(offset, std::mem::size_of::<usize>());
                let raw = Arc::as_ptr(s) as usize;
                msg.retained_strings.push(Arc::clone(s));
                put(&mut msg.buffer, at, raw.to_ne_bytes())?
            }
            (PrimType::Object, SendValue::Proxy { handle, name }) => {
                let at = align_to(offset, std::mem::size_of::<usize>());
                let handle_raw = Arc::as_ptr(handle) as usize;
                let name_raw = Arc::as_ptr(name) as usize;
                msg.retained_handles.push(Arc::clone(handle));
                msg.retained_strings.push(Arc::clone(name));
                let next = put(&mut msg.buffer, at, handle_raw.to_ne_bytes())?;
                put(&mut msg.buffer, next, name_raw.to_ne_bytes())?
            }
            (PrimType::Object, SendValue::Null) => {
                let at = align_to(offset, std::mem::size_of::<usize>());
                put(&mut msg.buffer, at, 0usize.to_ne_bytes())?
            }
            (PrimType::Object, SendValue::Bytes(bytes)) => {
                // Reference-free value types travel by content.
                match param_class {
                    Some(c) if c.is_value_type() && c.gc.map.is_empty() => {}
                    _ => {
                        return Err(HostError::TypeMismatch(format!(
                            "parameter `{}` cannot cross domains by content",
                            param.name
                        )))
                    }
                }
                let at = align_to(offset, std::mem::size_of::<usize>());
                let end = at + bytes.len();
                if end > msg.buffer.len() {
                    return Err(HostError::OutOfRange(
                        "domain message buffer overflow".into(),
                    ));
                }
                msg.buffer[at..end].copy_from_slice(bytes);
                end
            }
            (_, other) => {
                return Err(HostError::TypeMismatch(format!(
                    "argument {:?} does not match parameter `{}`",
                    other, param.name
                )))
            }
        };
    }
    msg.buffer_len = offset;
    Ok(())
}

/// Decodes the buffer on the receiving side using the target method's
/// signature. Shared payloads are re-counted, never copied.
pub fn unpack_args(registry: &Registry, method: &Method, msg: &DomainMessage) -> HostResult<Vec<RecvValue>> {
    let mut out = Vec::with_capacity(method.sig.params.len());
    let mut offset = 0usize;
    let string_class = registry.string_class();

    for param in &method.sig.params {
        let value = match param.ty.prim {
            PrimType::Int => {
                let at = align_to(offset, 4);
                let v = i32::from_ne_bytes(read4(&msg.buffer, at)?);
                offset = at + 4;
                RecvValue::Int(v)
            }
            PrimType::Float => {
                let at = align_to(offset, 4);
                let v = f32::from_ne_bytes(read4(&msg.buffer, at)?);
                offset = at + 4;
                RecvValue::Float(v)
            }
            PrimType::Bool => {
                let at = align_to(offset, 4);
                let v = i32::from_ne_bytes(read4(&msg.buffer, at)?);
                offset = at + 4;
                RecvValue::Bool(v != 0)
            }
            PrimType::Char => {
                let at = align_to(offset, 2);
                let v = u16::from_ne_bytes([msg.buffer[at], msg.buffer[at + 1]]);
                offset = at + 2;
                RecvValue::Char(v)
            }
            PrimType::Object => {
                let param_class = param.ty.resolved.map(|id| registry.class(id));
                let is_string = param.ty.resolved == Some(string_class);
                let is_proxy = matches!(
                    param_class.map(|c| c.special),
                    Some(SpecialClass::Foreign)
                );
                let is_blob_value = param_class
                    .map(|c| c.is_value_type() && c.gc.map.is_empty())
                    .unwrap_or(false);

                if is_string {
                    let at = align_to(offset, std::mem::size_of::<usize>());
                    let raw = usize::from_ne_bytes(read_word(&msg.buffer, at)?);
                    offset = at + std::mem::size_of::<usize>();
                    if raw == 0 {
                        RecvValue::Null
                    } else {
                        // The message retains the payload; bump the count
                        // for the receiver's wrapper.
                        let ptr = raw as *const SoStr;
                        let s = unsafe { crate::strings::sostr_clone_raw(ptr) };
                        RecvValue::Str(s)
                    }
                } else if is_proxy {
                    let at = align_to(offset, std::mem::size_of::<usize>());
                    let handle_raw = usize::from_ne_bytes(read_word(&msg.buffer, at)?);
                    let name_at = at + std::mem::size_of::<usize>();
                    let name_raw = usize::from_ne_bytes(read_word(&msg.buffer, name_at)?);
                    offset = name_at + std::mem::size_of::<usize>();
                    if handle_raw == 0 {
                        RecvValue::Null
                    } else {
                        let handle = unsafe {
                            Arc::increment_strong_count(handle_raw as *const DomainHandle);
                            Arc::from_raw(handle_raw as *const DomainHandle)
                        };
                        let name =
                            unsafe { crate::strings::sostr_clone_raw(name_raw as *const SoStr) };
                        RecvValue::Proxy { handle, name }
                    }
                } else if is_blob_value {
                    let size = param_class.map(|c| c.gc.content_size).unwrap_or(0);
                    let at = align_to(offset, std::mem::size_of::<usize>());
                    if at + size > msg.buffer.len() {
                        return Err(HostError::BadFormat("truncated message".into()));
                    }
                    let bytes = msg.buffer[at..at + size].to_vec();
                    offset = at + size;
                    RecvValue::Bytes(bytes)
                } else {
                    return Err(HostError::TypeMismatch(format!(
                        "parameter `{}` cannot be unmarshaled",
                        param.name
                    )));
                }
            }
            PrimType::Void | PrimType::IntPtr => {
                return Err(HostError::TypeMismatch(format!(
                    "parameter `{}` cannot cross domains",
                    param.name
                )))
            }
        };
        out.push(value);
    }
    Ok(out)
}

fn read4(buffer: &[u8], at: usize) -> HostResult<[u8; 4]> {
    buffer
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| HostError::BadFormat("truncated message".into()))
}

fn read_word(buffer: &[u8], at: usize) -> HostResult<[u8; std::mem::size_of::<usize>()]> {
    buffer
        .get(at..at + std::mem::size_of::<usize>())
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| HostError::BadFormat("truncated message".into()))
}

// ----------------------------------------------------------------------
// Domain handles.
// ----------------------------------------------------------------------

struct HandleState {
    queue: Option<Arc<DomainQueue>>,
    alive: bool,
    thread: Option<JoinHandle<()>>,
}

/// The gateway from one domain to another. The target reference is weak:
/// when the domain terminates the queue is dropped from the state, and all
/// access goes through the mutex so no caller ever observes a dangling
/// target.
pub struct DomainHandle {
    name: String,
    state: Mutex<HandleState>,
    /// Pulsed once the target domain has finished starting up; calls block
    /// on it so they never race domain construction.
    ready: Arc<WaitObject>,
    /// Pulsed when the domain terminates.
    done: Arc<WaitObject>,
}

impl std::fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainHandle").field("name", &self.name).finish()
    }
}

impl DomainHandle {
    pub fn new(name: impl Into<String>) -> Arc<DomainHandle> {
        Arc::new(DomainHandle {
            name: name.into(),
            state: Mutex::new(HandleState {
                queue: None,
                alive: false,
                thread: None,
            }),
            ready: WaitObject::new_sticky(),
            done: WaitObject::new_sticky(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes the started domain's queue and unblocks pending callers.
    pub fn mark_running(&self, queue: Arc<DomainQueue>, thread: Option<JoinHandle<()>>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.queue = Some(queue);
            state.alive = true;
            state.thread = thread;
        }
        self.ready.pulse();
        debug!("domain `{}` is ready", self.name);
    }

    /// Stores the spawned thread so `join` can reap it later.
    pub fn adopt_thread(&self, thread: JoinHandle<()>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.thread = Some(thread);
    }

    pub fn mark_dead(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.queue = None;
            state.alive = false;
        }
        // Unblock callers that raced termination.
        self.ready.pulse();
        self.done.pulse();
    }

    /// Best-effort liveness probe; for diagnostics only.
    pub fn is_alive(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).alive
    }

    /// Waits for the domain to finish (return from `main` or abort).
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.done.wait(timeout)
    }

    pub fn join(&self) {
        let thread = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.thread.take()
        };
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Enqueues the message and blocks on its result wait object. The
    /// target keeps running on timeout; the stale reply is discarded
    /// because nothing waits for it anymore.
    pub fn send_message_sync(
        &self,
        msg: Arc<DomainMessage>,
        timeout: Option<Duration>,
    ) -> HostResult<()> {
        if !self.ready.wait(Some(Duration::from_secs(30))) {
            return Err(HostError::Timeout(format!(
                "domain `{}` never became ready",
                self.name
            )));
        }

        let queue = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .queue
                .clone()
                .ok_or_else(|| HostError::InvalidState(format!("domain `{}` is gone", self.name)))?
        };

        trace!(
            "msgsnd -> {}::{}",
            msg.object_name.to_utf8(),
            msg.method_name.to_utf8()
        );
        let wait = Arc::clone(&msg.result_wait);
        queue.enqueue(msg);
        if !wait.wait(timeout) {
            return Err(HostError::Timeout("cross-domain call timed out".into()));
        }
        Ok(())
    }
}
