//! Skizo core runtime: execution domains with a tracing GC heap, vtable
//! and interface dispatch, runtime helpers for emitted code, a security
//! sandbox, synchronous cross-domain remoting, reflection and string
//! templates.
//!
//! A domain is an isolated process-within-a-process: its heap, registry,
//! virtual stacks and wait objects are owned by exactly one OS thread.
//! Cross-domain interaction funnels through the message queue; strings are
//! the only heap payload shared across domains, by reference count.

pub mod abort;
pub mod domain;
pub mod ecall;
pub mod gc;
pub mod helpers;
pub mod object;
pub mod platform;
pub mod reflection;
pub mod remoting;
pub mod security;
pub mod snapshot;
pub mod strings;
pub mod sync;
pub mod template;
pub mod thunks;

pub use abort::{abort_with_code, abort_with_message, catch_abort, DomainAbort};
pub use domain::{
    domain_sleep, run_path, run_path_untrusted, run_source, run_string, run_string_untrusted,
    spawn_domain, Domain, DomainCreation, Frontend, SourceRef, ThreadPriority,
};
pub use ecall::{clear_ecalls, lookup_ecall, register_ecall};
pub use gc::{MemoryManager, MIN_GC_THRESHOLD};
pub use object::{so_class_of, so_virtmeth_of, GcPtr};
pub use platform::{platform_string, tick_count, PlatformString};
pub use reflection::{get_properties, invoke_dynamic, invoke_raw, type_object_for, type_of};
pub use remoting::{DomainHandle, DomainMessage, SendValue, DOMAIN_MESSAGE_SIZE};
pub use security::{init_security, deinit_security, SecurityManager, FILE_IO_PERMISSION};
pub use snapshot::{
    snapshot_create, snapshot_load_from_file, snapshot_save_to_file, snapshot_to_tree,
    SnapshotNode, SnapshotValue,
};
pub use strings::{SoStr, StrSlice};
pub use sync::{MessageQueue, WaitObject};
pub use template::{template_for_class, Template};
pub use thunks::{call_invoker, InvokerFn, ThunkManager};
