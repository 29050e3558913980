// The execution domain: an isolated process-within-a-process owning its
// class registry, GC heap, security manager, thunk manager, exported-object
// table and message queue. One OS thread per domain; mutable object state
// never crosses domain boundaries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use skizo_codegen::{mangle, EmitEnv, EmitOptions, Emitter, NativeCompiler, NoTreeBodies, TableCompiler};
use skizo_diagnostics::{ErrorCode, StackFrameInfo};
use skizo_meta::{
    ClassId, Linker, MethodId, PrimType, Registry, SpecialClass, SpecialMethod, PTR_SIZE,
};

use crate::abort::{abort_raise, abort_with_message, catch_abort, DomainAbort};
use crate::gc::MemoryManager;
use crate::object::{
    so_class_of, ArrayHeader, DomainHandleHeader, ErrorHeader, ForeignProxyHeader, GcPtr,
    StringHeader, ARRAY_DATA_OFFSET,
};
use crate::remoting::{
    pack_args, unpack_args, DomainHandle, DomainMessage, DomainQueue, ErrorMsg, RecvValue,
    SendValue,
};
use crate::security::{SecurityManager, DOMAIN_CREATION_PERMISSION, FILE_IO_PERMISSION};
use crate::strings::{sostr_clone_raw, sostr_into_raw, SoStr, StrSlice};
use crate::sync::{MessageQueue, WaitObject};
use crate::thunks::{call_invoker, ThunkManager};

/// What a domain executes; parsing it into metadata is the frontend's job.
#[derive(Debug, Clone)]
pub enum SourceRef {
    Path(PathBuf),
    Text(String),
    MethodName(String),
}

/// Advisory only; recorded, never enforced by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    Lowest,
    #[default]
    Normal,
    Highest,
}

/// Domain construction parameters.
#[derive(Debug, Clone)]
pub struct DomainCreation {
    pub name: String,
    pub source: SourceRef,
    pub trusted: bool,
    pub permissions: Vec<String>,
    pub stack_trace_enabled: bool,
    pub profiling_enabled: bool,
    pub message_timeout: Duration,
    pub thread_priority: ThreadPriority,
}

impl DomainCreation {
    pub fn new(name: impl Into<String>, source: SourceRef) -> Self {
        Self {
            name: name.into(),
            source,
            trusted: true,
            permissions: Vec::new(),
            stack_trace_enabled: true,
            profiling_enabled: false,
            message_timeout: Duration::from_secs(10),
            thread_priority: ThreadPriority::Normal,
        }
    }

    pub fn untrusted(mut self) -> Self {
        self.trusted = false;
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

/// The external parser/emitter contract: collaborators the core consumes
/// without owning.
pub trait Frontend: Send + 'static {
    /// Turns the source reference into metadata inside the registry.
    fn parse(&self, source: &SourceRef, registry: &mut Registry) -> anyhow::Result<()>;

    /// The embedded C compiler backing the code generator.
    fn make_compiler(&self) -> Box<dyn NativeCompiler> {
        Box::new(TableCompiler::new())
    }

    /// Called after compilation: install native method bodies, export
    /// startup objects, seed statics.
    fn bind(&self, domain: &Rc<Domain>) -> anyhow::Result<()> {
        let _ = domain;
        Ok(())
    }
}

/// Snapshot of the virtual stacks, restored when an abort unwinds to a
/// guarded boundary. Native resources are untouched; only virtual-stack
/// bookkeeping rolls back.
#[derive(Debug, Clone, Copy)]
pub struct UnwindSnapshot {
    frames: usize,
    debug_entries: usize,
}

pub struct Domain {
    name: String,
    creation: DomainCreation,
    registry: RefCell<Registry>,
    mm: RefCell<MemoryManager>,
    security: RefCell<SecurityManager>,
    thunks: ThunkManager,
    exported: RefCell<HashMap<String, usize>>,
    frames: RefCell<Vec<MethodId>>,
    /// (locals-buffer address, slot count) pairs from the soft debugger.
    debug_stack: RefCell<Vec<(usize, usize)>>,
    statics: RefCell<HashMap<ClassId, Box<[u8]>>>,
    queue: Arc<DomainQueue>,
    result_wait: Arc<WaitObject>,
    self_handle: RefCell<Option<Arc<DomainHandle>>>,
    /// Pins domain handles referenced by GC objects for the domain's life.
    retained_handles: RefCell<Vec<Arc<DomainHandle>>>,
    is_base: bool,
    /// Cooperative thread-abort flag; user code polls it.
    abort_requested: Arc<AtomicBool>,
}

thread_local! {
    static CURRENT_DOMAIN: RefCell<Option<Rc<Domain>>> = const { RefCell::new(None) };
}

impl Domain {
    // ------------------------------------------------------------------
    // Construction & lifecycle.
    // ------------------------------------------------------------------

    pub fn create(creation: DomainCreation, frontend: &dyn Frontend) -> anyhow::Result<Rc<Domain>> {
        Self::create_inner(creation, frontend, false)
    }

    fn create_inner(
        creation: DomainCreation,
        frontend: &dyn Frontend,
        is_base: bool,
    ) -> anyhow::Result<Rc<Domain>> {
        info!("creating domain `{}`", creation.name);
        let mut registry = Registry::new();
        frontend
            .parse(&creation.source, &mut registry)
            .context("parse failed")?;
        registry.resolve_all().context("type resolution failed")?;
        Linker::link(&mut registry).context("link failed")?;

        let mut security = SecurityManager::new();
        security.set_trusted(creation.trusted);
        for permission in &creation.permissions {
            security.add_permission(permission.clone());
        }
        security.init_secure_io();

        let mut mm = MemoryManager::new();
        let stack_probe = 0usize;
        mm.set_stack_base(&stack_probe as *const usize as usize);

        let domain = Rc::new(Domain {
            name: creation.name.clone(),
            thunks: ThunkManager::new(frontend.make_compiler()),
            registry: RefCell::new(registry),
            mm: RefCell::new(mm),
            security: RefCell::new(security),
            exported: RefCell::new(HashMap::new()),
            frames: RefCell::new(Vec::new()),
            debug_stack: RefCell::new(Vec::new()),
            statics: RefCell::new(HashMap::new()),
            queue: MessageQueue::new(),
            result_wait: WaitObject::new(),
            self_handle: RefCell::new(None),
            retained_handles: RefCell::new(Vec::new()),
            is_base,
            creation,
            abort_requested: Arc::new(AtomicBool::new(false)),
        });

        Domain::set_current(Some(Rc::clone(&domain)));
        domain.compile_and_install()?;
        domain.allocate_statics();
        frontend.bind(&domain).context("bind failed")?;
        Ok(domain)
    }

    /// Emits the translation unit, compiles it and installs every resolved
    /// pointer into metadata; vtables missing from the unit (free-vtable
    /// classes, table-compiler runs) are built natively.
    fn compile_and_install(self: &Rc<Self>) -> anyhow::Result<()> {
        let env = EmitEnv {
            domain_addr: Rc::as_ptr(self) as usize,
            memory_manager_addr: self.mm.as_ptr() as usize,
        };
        let opts = EmitOptions {
            stack_trace: self.creation.stack_trace_enabled,
            profiling: self.creation.profiling_enabled,
        };

        let registry = self.registry.borrow();
        let unit_text = Emitter::new(&registry, env, opts)
            .emit_unit(&NoTreeBodies)
            .context("emission failed")?;

        let mut prolog_addr = 0usize;
        self.thunks
            .compile_unit(&unit_text, |unit| {
                for class_id in registry.class_ids() {
                    let class = registry.class(class_id);
                    let all = class
                        .instance_methods
                        .iter()
                        .chain(class.static_methods.iter())
                        .chain(class.instance_ctors.iter())
                        .chain(class.instance_dtor.iter())
                        .chain(class.static_ctor.iter())
                        .chain(class.static_dtor.iter());
                    for &mid in all {
                        let method = registry.method(mid);
                        if method.declaring_class != class_id {
                            continue;
                        }
                        if let Some(addr) = unit.symbol(&mangle::method_symbol(&registry, mid)) {
                            method.set_native_ptr(addr);
                        }
                        if let Some(addr) = unit.symbol(&mangle::invoker_symbol(&registry, mid)) {
                            method.set_invoker_ptr(addr);
                        }
                        if method.special == SpecialMethod::Native {
                            let symbol = method
                                .ecall
                                .entry_point
                                .clone()
                                .unwrap_or_else(|| mangle::method_symbol(&registry, mid).into());
                            if let Some(addr) = crate::ecall::lookup_ecall(&symbol) {
                                method.set_native_ptr(addr);
                                method.set_invoker_ptr(addr);
                            }
                        }
                    }
                }
                prolog_addr = unit.symbol(mangle::PROLOG_SYMBOL).unwrap_or(0);
            })
            .context("compilation failed")?;

        if prolog_addr != 0 {
            // The real backend registers emitted vtables and patches string
            // literals itself.
            unsafe {
                let prolog: unsafe extern "C-unwind" fn() = std::mem::transmute(prolog_addr);
                prolog();
            }
        }

        // Fallback for everything the unit did not register.
        for class_id in registry.class_ids() {
            let class = registry.class(class_id);
            if class.has_vtable() && class.vtable() == 0 && !class.is_interface() {
                self.thunks.build_vtable(&registry, class_id);
            }
        }
        drop(registry);
        self.patch_string_literals();
        Ok(())
    }

    /// Zeroed static storage per class; reference slots become GC roots,
    /// registered once after link.
    fn allocate_statics(&self) {
        let registry = self.registry.borrow();
        let mut mm = self.mm.borrow_mut();
        let mut statics = self.statics.borrow_mut();
        for class_id in registry.class_ids() {
            let class = registry.class(class_id);
            if class.static_size == 0 {
                continue;
            }
            let block = vec![0u8; class.static_size].into_boxed_slice();
            let base = block.as_ptr() as usize;
            let mut slots = Vec::new();
            for field in &class.static_fields {
                if let Some(field_class) = field.ty.resolved.map(|id| registry.class(id)) {
                    if field_class.is_value_type() {
                        for &offset in &field_class.gc.map {
                            slots.push(base + field.offset + offset);
                        }
                    } else if field_class.is_ref_type() {
                        slots.push(base + field.offset);
                    }
                }
            }
            mm.add_root_slots(&slots);
            statics.insert(class_id, block);
        }
    }

    /// Tears the domain down: clears roots, runs the judgement-day
    /// collection, frees string literals, removes the secure directory.
    pub fn teardown(&self) {
        debug!("tearing down domain `{}`", self.name);
        self.exported.borrow_mut().clear();
        {
            let registry = self.registry.borrow();
            let string_class = registry.string_class();
            self.mm.borrow_mut().teardown(&registry, string_class);
        }
        self.security.borrow_mut().deinit_secure_io();
        if let Some(handle) = self.self_handle.borrow().as_ref() {
            handle.mark_dead();
        }
    }

    // ------------------------------------------------------------------
    // Thread-local current domain.
    // ------------------------------------------------------------------

    pub fn set_current(domain: Option<Rc<Domain>>) {
        CURRENT_DOMAIN.with(|slot| *slot.borrow_mut() = domain);
    }

    pub fn current() -> Rc<Domain> {
        match Self::try_current() {
            Some(domain) => domain,
            None => abort_with_message("No domain is attached to the current thread."),
        }
    }

    pub fn try_current() -> Option<Rc<Domain>> {
        CURRENT_DOMAIN.with(|slot| slot.borrow().clone())
    }

    // ------------------------------------------------------------------
    // Accessors.
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_base_domain(&self) -> bool {
        self.is_base
    }

    pub fn is_trusted(&self) -> bool {
        self.security.borrow().is_trusted()
    }

    pub fn permissions(&self) -> Vec<String> {
        self.security.borrow().permissions().to_vec()
    }

    pub fn registry(&self) -> &RefCell<Registry> {
        &self.registry
    }

    pub fn memory_manager(&self) -> &RefCell<MemoryManager> {
        &self.mm
    }

    pub fn security(&self) -> &RefCell<SecurityManager> {
        &self.security
    }

    pub fn thunks(&self) -> &ThunkManager {
        &self.thunks
    }

    pub fn queue(&self) -> &Arc<DomainQueue> {
        &self.queue
    }

    pub fn result_wait(&self) -> &Arc<WaitObject> {
        &self.result_wait
    }

    pub fn creation(&self) -> &DomainCreation {
        &self.creation
    }

    pub fn abort_flag(&self) -> &Arc<AtomicBool> {
        &self.abort_requested
    }

    pub fn static_base(&self, class: ClassId) -> Option<usize> {
        self.statics.borrow().get(&class).map(|b| b.as_ptr() as usize)
    }

    /// Installs a natively implemented method body (an invoker-ABI function)
    /// and republishes the declaring class's vtable.
    pub fn install_native_method(&self, method: MethodId, invoker: usize) {
        let registry = self.registry.borrow();
        let m = registry.method(method);
        m.set_native_ptr(invoker);
        m.set_invoker_ptr(invoker);
        let declaring = m.declaring_class;
        if registry.class(declaring).has_vtable() {
            self.thunks.build_vtable(&registry, declaring);
        }
    }

    // ------------------------------------------------------------------
    // Allocation.
    // ------------------------------------------------------------------

    pub fn gc_alloc(&self, size: usize, vtable: usize) -> GcPtr {
        if self.mm.borrow().should_collect() {
            self.collect_garbage();
        }
        let obj = self.mm.borrow_mut().alloc(size, vtable as *mut usize);
        if obj.is_null() {
            crate::abort::abort_with_code(ErrorCode::OutOfMemory);
        }
        obj
    }

    pub fn ensure_vtable(&self, class: ClassId) -> usize {
        let registry = self.registry.borrow();
        let existing = registry.class(class).vtable();
        if existing != 0 {
            return existing;
        }
        self.thunks.build_vtable(&registry, class)
    }

    pub fn create_object(&self, class: ClassId) -> GcPtr {
        let size = self.registry.borrow().class(class).gc.content_size;
        let vtable = self.ensure_vtable(class);
        self.gc_alloc(size, vtable)
    }

    pub fn create_string_shared(&self, text: Arc<SoStr>) -> GcPtr {
        let string_class = self.registry.borrow().string_class();
        let vtable = self.ensure_vtable(string_class);
        let obj = self.gc_alloc(2 * PTR_SIZE, vtable);
        unsafe {
            (*(obj as *mut StringHeader)).pstr = sostr_into_raw(text);
        }
        obj
    }

    pub fn create_string(&self, text: &str) -> GcPtr {
        self.create_string_shared(SoStr::from_utf8(text))
    }

    pub fn create_string_literal(&self, text: &str) -> *mut StringHeader {
        let string_class = self.registry.borrow().string_class();
        let vtable = self.registry.borrow().class(string_class).vtable();
        self.mm
            .borrow_mut()
            .alloc_string_literal(SoStr::from_utf8(text), vtable as *mut usize)
    }

    pub fn patch_string_literals(&self) {
        let string_class = self.registry.borrow().string_class();
        let vtable = self.ensure_vtable(string_class);
        self.mm
            .borrow_mut()
            .patch_string_literals(vtable as *mut usize);
    }

    pub fn create_array(&self, array_class: ClassId, length: i32) -> GcPtr {
        if length < 0 {
            crate::abort::abort_with_code(ErrorCode::RangeCheck);
        }
        let stride = {
            let registry = self.registry.borrow();
            let class = registry.class(array_class);
            class
                .wrapped
                .as_ref()
                .and_then(|w| w.resolved)
                .map(|id| registry.class(id).gc.size_for_use)
                .unwrap_or(PTR_SIZE)
        };
        let vtable = self.ensure_vtable(array_class);
        let size = ARRAY_DATA_OFFSET + stride * length as usize;
        let obj = self.gc_alloc(size, vtable);
        unsafe {
            (*(obj as *mut ArrayHeader)).length = length;
        }
        obj
    }

    pub fn create_error(&self, message: &str) -> GcPtr {
        let error_class = self.registry.borrow().error_class();
        let vtable = self.ensure_vtable(error_class);
        let obj = self.gc_alloc(2 * PTR_SIZE, vtable);
        // Pinned while the message allocation below may collect.
        self.mm.borrow_mut().add_root(obj);
        let message_obj = self.create_string(message);
        unsafe {
            (*(obj as *mut ErrorHeader)).message = message_obj as *mut StringHeader;
        }
        self.mm.borrow_mut().remove_root(obj);
        obj
    }

    /// Wraps value bytes into a freshly allocated boxed object.
    pub fn box_value(&self, boxed_class: ClassId, bytes: &[u8]) -> GcPtr {
        let size = self.registry.borrow().class(boxed_class).gc.content_size;
        let vtable = self.ensure_vtable(boxed_class);
        let obj = self.gc_alloc(size, vtable);
        unsafe {
            let dst = crate::object::boxed_data(obj);
            let n = bytes.len().min(size - PTR_SIZE);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, n);
        }
        obj
    }

    // ------------------------------------------------------------------
    // GC orchestration: gathers the domain-level root set.
    // ------------------------------------------------------------------

    pub fn collect_garbage(&self) {
        let mut roots: Vec<usize> = Vec::new();
        for &obj in self.exported.borrow().values() {
            roots.push(obj);
        }
        for &(base, count) in self.debug_stack.borrow().iter() {
            for i in 0..count {
                let slot = unsafe { *((base + i * PTR_SIZE) as *const usize) };
                if slot != 0 {
                    roots.push(slot);
                }
            }
        }
        let registry = self.registry.borrow();
        let string_class = registry.string_class();
        self.mm.borrow_mut().collect(&registry, &roots, string_class);
    }

    // ------------------------------------------------------------------
    // Virtual stacks & unwinding.
    // ------------------------------------------------------------------

    pub fn push_frame(&self, method: MethodId) {
        self.frames.borrow_mut().push(method);
    }

    pub fn pop_frame(&self) -> Option<MethodId> {
        self.frames.borrow_mut().pop()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn push_debug_entry(&self, base: usize, count: usize) {
        self.debug_stack.borrow_mut().push((base, count));
    }

    pub fn pop_debug_entry(&self) {
        self.debug_stack.borrow_mut().pop();
    }

    pub fn unwind_snapshot(&self) -> UnwindSnapshot {
        UnwindSnapshot {
            frames: self.frames.borrow().len(),
            debug_entries: self.debug_stack.borrow().len(),
        }
    }

    pub fn unwind_to(&self, snapshot: UnwindSnapshot) {
        self.frames.borrow_mut().truncate(snapshot.frames);
        self.debug_stack.borrow_mut().truncate(snapshot.debug_entries);
    }

    pub fn stack_trace_string(&self) -> String {
        let registry = self.registry.borrow();
        let frames: Vec<StackFrameInfo> = self
            .frames
            .borrow()
            .iter()
            .map(|&mid| {
                let method = registry.method(mid);
                let mut info = StackFrameInfo::new(
                    registry.class(method.declaring_class).flat_name.to_string(),
                    method.name.to_string(),
                );
                info.source = method.source.clone();
                info
            })
            .collect();
        skizo_diagnostics::render_stack_trace(&frames)
    }

    /// `Domain.try`: runs the action under an unwind snapshot. On abort the
    /// virtual stacks are restored and the abort message (with the stack
    /// trace captured at the raise point) is returned.
    pub fn try_run<R>(&self, action: impl FnOnce() -> R) -> Result<R, String> {
        let snapshot = self.unwind_snapshot();
        match catch_abort(action) {
            Ok(value) => Ok(value),
            Err(abort) => {
                let trace = self.stack_trace_string();
                self.unwind_to(snapshot);
                Err(format!("{}\n{}", abort.message, trace))
            }
        }
    }

    /// Two-stage static-constructor invocation: an abort flips the class to
    /// uninitialized so later checked accesses raise code 8.
    pub fn run_static_ctor(&self, class: ClassId) {
        let ctor = {
            let registry = self.registry.borrow();
            registry.class(class).static_ctor
        };
        let Some(ctor) = ctor else { return };
        let invoker = self.registry.borrow().method(ctor).invoker_ptr();
        if invoker == 0 {
            return;
        }
        let snapshot = self.unwind_snapshot();
        let result = catch_abort(|| unsafe {
            let mut args = [std::ptr::null_mut::<u8>()];
            call_invoker(invoker, args.as_mut_ptr());
        });
        if result.is_err() {
            warn!("static ctor aborted; class marked uninitialized");
            self.registry.borrow().class(class).set_initialized(false);
            self.unwind_to(snapshot);
        }
    }

    // ------------------------------------------------------------------
    // Exported objects & foreign proxies.
    // ------------------------------------------------------------------

    pub fn export_object(&self, name: &str, obj: GcPtr) {
        self.exported.borrow_mut().insert(name.to_string(), obj as usize);
    }

    pub fn exported_object(&self, name: &str) -> Option<GcPtr> {
        self.exported.borrow().get(name).map(|&addr| addr as GcPtr)
    }

    /// Allocates a foreign-proxy instance bound to an exported object in
    /// the target domain.
    pub fn import_object(
        &self,
        foreign_class: ClassId,
        handle: Arc<DomainHandle>,
        name: &str,
    ) -> GcPtr {
        let handle_class = {
            let registry = self.registry.borrow();
            registry
                .class_by_name("DomainHandle")
                .unwrap_or_else(|| registry.any_class())
        };
        let handle_vtable = self.ensure_vtable(handle_class);
        let handle_obj = self.gc_alloc(2 * PTR_SIZE, handle_vtable);
        unsafe {
            (*(handle_obj as *mut DomainHandleHeader)).wrapped = Arc::as_ptr(&handle);
        }
        self.retained_handles.borrow_mut().push(handle);

        // Pin the pieces while the remaining allocations may collect.
        self.mm.borrow_mut().add_root(handle_obj);
        let name_obj = self.create_string(name);
        self.mm.borrow_mut().add_root(name_obj);

        let proxy_size = self.registry.borrow().class(foreign_class).gc.content_size;
        let proxy_vtable = self.ensure_vtable(foreign_class);
        let proxy = self.gc_alloc(proxy_size.max(3 * PTR_SIZE), proxy_vtable);
        unsafe {
            let header = proxy as *mut ForeignProxyHeader;
            (*header).hdomain = handle_obj as *mut DomainHandleHeader;
            (*header).name = name_obj as *mut StringHeader;
        }
        let mut mm = self.mm.borrow_mut();
        mm.remove_root(handle_obj);
        mm.remove_root(name_obj);
        drop(mm);
        proxy
    }

    // ------------------------------------------------------------------
    // Remoting: client side.
    // ------------------------------------------------------------------

    /// Synchronous cross-domain call through a foreign proxy. Packs the
    /// argument words per the method signature, sends, blocks, re-raises
    /// target aborts, converts the reply.
    pub fn foreign_invoke(&self, method: MethodId, proxy: GcPtr, arg_words: &[*mut u8]) -> *mut u8 {
        let (handle, object_name) = unsafe {
            let header = proxy as *const ForeignProxyHeader;
            let handle_header = (*header).hdomain;
            if handle_header.is_null() {
                crate::abort::abort_with_code(ErrorCode::NullDereference);
            }
            let handle_ptr = (*handle_header).wrapped;
            Arc::increment_strong_count(handle_ptr);
            let handle = Arc::from_raw(handle_ptr);
            let name = sostr_clone_raw((*(*header).name).pstr);
            (handle, name)
        };
        self.foreign_send(handle, object_name, method, arg_words)
    }

    /// The raw send path shared by proxy calls and the `msgsnd` helper.
    pub fn foreign_send(
        &self,
        handle: Arc<DomainHandle>,
        object_name: Arc<SoStr>,
        method: MethodId,
        arg_words: &[*mut u8],
    ) -> *mut u8 {
        let (send_values, method_name) = {
            let registry = self.registry.borrow();
            let m = registry.method(method);
            let mut values = Vec::with_capacity(m.sig.params.len());
            for (i, param) in m.sig.params.iter().enumerate() {
                let word = arg_words[i];
                values.push(self.word_to_send_value(&registry, &param.ty, word));
            }
            (values, m.name.to_string())
        };

        let mut msg = DomainMessage::new(
            object_name,
            StrSlice::from_utf8(&method_name),
            Arc::clone(&self.result_wait),
        );
        {
            let registry = self.registry.borrow();
            if let Err(err) = pack_args(&registry, registry.method(method), &send_values, &mut msg)
            {
                abort_with_message(err.to_string());
            }
        }

        let msg = Arc::new(msg);
        if let Err(err) =
            handle.send_message_sync(Arc::clone(&msg), Some(self.creation.message_timeout))
        {
            abort_with_message(err.to_string());
        }
        if let Some(error) = msg.take_error() {
            // An abort inside the target surfaces here, re-raised with the
            // same message.
            abort_with_message(error.text().to_string());
        }

        let ret = msg.read_ret();
        let registry = self.registry.borrow();
        let ret_ty = registry.method(method).sig.ret.clone();
        drop(registry);
        self.ret_bytes_to_word(&ret_ty, &ret.bytes)
    }

    fn word_to_send_value(
        &self,
        registry: &Registry,
        ty: &skizo_meta::TypeRef,
        word: *mut u8,
    ) -> SendValue {
        match ty.prim {
            PrimType::Int => SendValue::Int(crate::thunks::word_to_i32(word)),
            PrimType::Float => SendValue::Float(crate::thunks::word_to_f32(word)),
            PrimType::Bool => SendValue::Bool(crate::thunks::word_to_bool(word)),
            PrimType::Char => SendValue::Char(word as usize as u16),
            PrimType::Object => {
                if word.is_null() {
                    return SendValue::Null;
                }
                let class = unsafe { so_class_of(word) };
                if class.id == registry.string_class() {
                    let s = unsafe { sostr_clone_raw((*(word as *const StringHeader)).pstr) };
                    SendValue::Str(s)
                } else if class.special == SpecialClass::Foreign {
                    unsafe {
                        let header = word as *const ForeignProxyHeader;
                        let handle_ptr = (*(*header).hdomain).wrapped;
                        Arc::increment_strong_count(handle_ptr);
                        let handle = Arc::from_raw(handle_ptr);
                        let name = sostr_clone_raw((*(*header).name).pstr);
                        SendValue::Proxy { handle, name }
                    }
                } else if class.is_value_type() && class.gc.map.is_empty() {
                    let bytes = unsafe {
                        std::slice::from_raw_parts(word as *const u8, class.gc.content_size)
                    }
                    .to_vec();
                    SendValue::Bytes(bytes)
                } else {
                    abort_with_message(
                        "Only primitives, strings and foreign references can cross domains.",
                    )
                }
            }
            _ => abort_with_message("This value cannot cross domains."),
        }
    }

    fn ret_bytes_to_word(&self, ty: &skizo_meta::TypeRef, bytes: &[u8; 16]) -> *mut u8 {
        match ty.prim {
            PrimType::Void => std::ptr::null_mut(),
            PrimType::Int | PrimType::Bool => {
                let v = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                crate::thunks::word_from_i32(v)
            }
            PrimType::Float => {
                let v = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                crate::thunks::word_from_f32(v)
            }
            PrimType::Char => {
                u16::from_ne_bytes([bytes[0], bytes[1]]) as usize as *mut u8
            }
            PrimType::Object => {
                let registry = self.registry.borrow();
                let is_string = ty.resolved == Some(registry.string_class());
                drop(registry);
                let mut word = [0u8; PTR_SIZE];
                word.copy_from_slice(&bytes[..PTR_SIZE]);
                let raw = usize::from_ne_bytes(word);
                if raw == 0 {
                    std::ptr::null_mut()
                } else if is_string {
                    // Ownership of one count travels in the reply slot.
                    let s = unsafe { Arc::from_raw(raw as *const SoStr) };
                    self.create_string_shared(s)
                } else {
                    abort_with_message("Unsupported cross-domain return type.")
                }
            }
            PrimType::IntPtr => abort_with_message("Unsupported cross-domain return type."),
        }
    }

    // ------------------------------------------------------------------
    // Remoting: server side.
    // ------------------------------------------------------------------

    /// Polls the incoming queue, invoking the stop predicate between
    /// messages to decide whether to exit.
    pub fn listen(&self, mut stop: impl FnMut() -> bool) {
        while !stop() {
            if let Some(msg) = self.queue.poll(Duration::from_millis(100)) {
                self.dispatch_message(&msg);
            }
        }
    }

    /// Serves exactly `count` messages, waiting up to 10 seconds for each;
    /// used by driver loops and tests.
    pub fn serve_messages(&self, count: usize) {
        for _ in 0..count {
            match self.queue.poll(Duration::from_secs(10)) {
                Some(msg) => self.dispatch_message(&msg),
                None => break,
            }
        }
    }

    fn dispatch_message(&self, msg: &Arc<DomainMessage>) {
        let object_name = msg.object_name.to_utf8();
        let method_name = msg.method_name.to_utf8();

        let target = match self.exported_object(&object_name) {
            Some(obj) => obj,
            None => {
                msg.set_error(ErrorMsg::Owned(format!(
                    "No exported object named `{}`.",
                    object_name
                )));
                msg.result_wait.pulse();
                return;
            }
        };

        let result = catch_abort(|| self.invoke_exported(target, &method_name, msg));
        if let Err(abort) = result {
            msg.set_error(ErrorMsg::Owned(abort.message));
        }
        msg.result_wait.pulse();
    }

    /// `findmethod`-style dispatch on the named exported object, then the
    /// invoker call with unpacked arguments.
    fn invoke_exported(&self, target: GcPtr, method_name: &str, msg: &Arc<DomainMessage>) {
        let class = unsafe { so_class_of(target) };
        let (method_id, invoker, param_classes, ret_ty) = {
            let registry = self.registry.borrow();
            let mid = match registry.instance_method_by_name(class.id, method_name) {
                Some(mid) => mid,
                None => abort_with_message(format!("Unknown method `{}`.", method_name)),
            };
            let method = registry.method(mid);
            let invoker = method.invoker_ptr();
            if invoker == 0 {
                abort_with_message(format!("Method `{}` has no code.", method_name));
            }
            let param_classes: Vec<_> = method.sig.params.iter().map(|p| p.ty.resolved).collect();
            (mid, invoker, param_classes, method.sig.ret.clone())
        };

        let values = {
            let registry = self.registry.borrow();
            match unpack_args(&registry, registry.method(method_id), msg) {
                Ok(values) => values,
                Err(err) => abort_with_message(err.to_string()),
            }
        };

        // Convert received values into invoker words; temporaries pinned
        // for the duration of the call so interleaved collections cannot
        // reclaim freshly wrapped arguments.
        let mut pinned_bytes: Vec<Vec<u8>> = Vec::new();
        let mut pinned_objects: Vec<GcPtr> = Vec::new();
        let mut words: Vec<*mut u8> = vec![target];
        for (value, param_class) in values.into_iter().zip(param_classes) {
            let word = match value {
                RecvValue::Int(v) => crate::thunks::word_from_i32(v),
                RecvValue::Float(v) => crate::thunks::word_from_f32(v),
                RecvValue::Bool(v) => crate::thunks::word_from_bool(v),
                RecvValue::Char(v) => v as usize as *mut u8,
                RecvValue::Null => std::ptr::null_mut(),
                RecvValue::Str(s) => {
                    let obj = self.create_string_shared(s);
                    self.mm.borrow_mut().add_root(obj);
                    pinned_objects.push(obj);
                    obj
                }
                RecvValue::Proxy { handle, name } => {
                    let is_self = self
                        .self_handle
                        .borrow()
                        .as_ref()
                        .map(|own| Arc::ptr_eq(own, &handle))
                        .unwrap_or(false);
                    if is_self {
                        // A proxy to one of our own exports unwraps to the
                        // local object.
                        match self.exported_object(&name.to_utf8()) {
                            Some(obj) => obj,
                            None => abort_with_message("Unknown exported object in proxy."),
                        }
                    } else {
                        match param_class {
                            Some(c) => {
                                let obj = self.import_object(c, handle, &name.to_utf8());
                                self.mm.borrow_mut().add_root(obj);
                                pinned_objects.push(obj);
                                obj
                            }
                            None => abort_with_message("Cannot unmarshal foreign reference."),
                        }
                    }
                }
                RecvValue::Bytes(bytes) => {
                    pinned_bytes.push(bytes);
                    pinned_bytes
                        .last()
                        .map(|b| b.as_ptr() as *mut u8)
                        .unwrap_or(std::ptr::null_mut())
                }
            };
            words.push(word);
        }

        let ret_word = unsafe { call_invoker(invoker, words.as_mut_ptr()) };
        {
            let mut mm = self.mm.borrow_mut();
            for obj in pinned_objects.drain(..) {
                mm.remove_root(obj);
            }
        }

        // Pack the reply into the message's return slot.
        match ret_ty.prim {
            PrimType::Void => msg.write_ret(&[]),
            PrimType::Int | PrimType::Bool => {
                msg.write_ret(&crate::thunks::word_to_i32(ret_word).to_ne_bytes())
            }
            PrimType::Float => msg.write_ret(&crate::thunks::word_to_f32(ret_word).to_ne_bytes()),
            PrimType::Char => msg.write_ret(&(ret_word as usize as u16).to_ne_bytes()),
            PrimType::Object => {
                let registry = self.registry.borrow();
                let is_string = ret_ty.resolved == Some(registry.string_class());
                drop(registry);
                if ret_word.is_null() {
                    msg.write_ret(&0usize.to_ne_bytes());
                } else if is_string {
                    let s = unsafe { sostr_clone_raw((*(ret_word as *const StringHeader)).pstr) };
                    let raw = sostr_into_raw(s) as usize;
                    msg.write_ret(&raw.to_ne_bytes());
                } else {
                    abort_with_message("Unsupported cross-domain return type.");
                }
            }
            PrimType::IntPtr => abort_with_message("Unsupported cross-domain return type."),
        }
    }

    // ------------------------------------------------------------------
    // Running.
    // ------------------------------------------------------------------

    /// Finds `Program::main` and runs it to completion.
    pub fn run_main(&self) -> Result<(), DomainAbort> {
        let invoker = {
            let registry = self.registry.borrow();
            let program = registry.class_by_name("Program");
            let main = program.and_then(|p| registry.static_method_by_name(p, "main"));
            match main {
                Some(mid) => registry.method(mid).invoker_ptr(),
                None => 0,
            }
        };
        if invoker == 0 {
            return Err(DomainAbort::from_message("Program::main not found."));
        }
        catch_abort(|| unsafe {
            let mut args = [std::ptr::null_mut::<u8>()];
            call_invoker(invoker, args.as_mut_ptr());
        })
    }

    /// Spawns a child domain on its own thread. An untrusted parent cannot
    /// alter the permission set; the child inherits it and stays untrusted.
    pub fn create_child_domain<F: Frontend>(
        &self,
        mut creation: DomainCreation,
        frontend: F,
    ) -> Arc<DomainHandle> {
        self.security.borrow().demand_permission(DOMAIN_CREATION_PERMISSION);
        if matches!(creation.source, SourceRef::Path(_) | SourceRef::MethodName(_)) {
            self.security.borrow().demand_permission(FILE_IO_PERMISSION);
        }
        if !self.is_trusted() {
            if !creation.permissions.is_empty() {
                abort_with_message(
                    "Untrusted domains aren't allowed to spawn new domains with altered permission sets.",
                );
            }
            creation.trusted = false;
            creation.permissions = self.permissions();
        }
        spawn_domain(creation, frontend)
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        debug!("domain `{}` dropped", self.name);
    }
}

// ----------------------------------------------------------------------
// Embedder entry points.
// ----------------------------------------------------------------------

/// Runs a domain to completion on the current thread (the base domain).
pub fn run_source(creation: DomainCreation, frontend: &dyn Frontend) -> anyhow::Result<()> {
    let domain = Domain::create_inner(creation, frontend, true)?;
    let result = domain.run_main();
    domain.teardown();
    Domain::set_current(None);
    match result {
        Ok(()) => Ok(()),
        Err(abort) => Err(anyhow::anyhow!("domain aborted: {}", abort.message)),
    }
}

pub fn run_string(
    name: &str,
    text: &str,
    permissions: &[&str],
    frontend: &dyn Frontend,
) -> anyhow::Result<()> {
    let mut creation = DomainCreation::new(name, SourceRef::Text(text.to_string()));
    creation.permissions = permissions.iter().map(|p| p.to_string()).collect();
    run_source(creation, frontend)
}

pub fn run_string_untrusted(
    name: &str,
    text: &str,
    permissions: &[&str],
    frontend: &dyn Frontend,
) -> anyhow::Result<()> {
    let mut creation = DomainCreation::new(name, SourceRef::Text(text.to_string())).untrusted();
    creation.permissions = permissions.iter().map(|p| p.to_string()).collect();
    run_source(creation, frontend)
}

pub fn run_path(
    name: &str,
    path: impl Into<PathBuf>,
    permissions: &[&str],
    frontend: &dyn Frontend,
) -> anyhow::Result<()> {
    let mut creation = DomainCreation::new(name, SourceRef::Path(path.into()));
    creation.permissions = permissions.iter().map(|p| p.to_string()).collect();
    run_source(creation, frontend)
}

pub fn run_path_untrusted(
    name: &str,
    path: impl Into<PathBuf>,
    permissions: &[&str],
    frontend: &dyn Frontend,
) -> anyhow::Result<()> {
    let mut creation = DomainCreation::new(name, SourceRef::Path(path.into())).untrusted();
    creation.permissions = permissions.iter().map(|p| p.to_string()).collect();
    run_source(creation, frontend)
}

/// Spawns a domain on a fresh thread and returns its handle. The handle's
/// readiness wait object is pulsed once startup completed, so synchronous
/// calls issued immediately after return block instead of failing.
pub fn spawn_domain<F: Frontend>(creation: DomainCreation, frontend: F) -> Arc<DomainHandle> {
    let handle = DomainHandle::new(creation.name.clone());
    let handle_for_thread = Arc::clone(&handle);
    let thread_name = creation.name.clone();

    let thread = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            match Domain::create(creation, &frontend) {
                Ok(domain) => {
                    *domain.self_handle.borrow_mut() = Some(Arc::clone(&handle_for_thread));
                    handle_for_thread.mark_running(Arc::clone(&domain.queue), None);
                    if let Err(abort) = domain.run_main() {
                        warn!("domain `{}` aborted: {}", domain.name(), abort.message);
                    }
                    domain.teardown();
                    Domain::set_current(None);
                }
                Err(err) => {
                    warn!("domain creation failed: {:#}", err);
                    handle_for_thread.mark_dead();
                }
            }
        });

    match thread {
        Ok(join) => handle.adopt_thread(join),
        Err(err) => {
            warn!("failed to spawn domain thread: {}", err);
            handle.mark_dead();
        }
    }
    handle
}

/// `Domain.sleep`: the only explicit suspension point besides waits.
pub fn domain_sleep(millis: u64) {
    if millis < 1 {
        abort_with_message("Argument to Domain::sleep(int) must be equal or greater than 1.");
    }
    std::thread::sleep(Duration::from_millis(millis));
}

/// Re-raises a caught abort; used by icall layers that must not swallow.
pub fn rethrow(abort: DomainAbort) -> ! {
    abort_raise(abort)
}
