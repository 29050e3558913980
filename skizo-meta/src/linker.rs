// The linker runs once, after parsing and after type resolution reached a
// fixed point. It finalizes method lists (vtable index assignment), lays
// out fields (offsets + GC maps) and borrows attributes down the hierarchy.

use log::debug;
use thiserror::Error;

use crate::class::{ClassFlags, SpecialClass};
use crate::ids::ClassId;
use crate::member::well_known_attrs;
use crate::registry::{Registry, PTR_SIZE};
use crate::typeref::PrimType;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("cyclic base-class dependency involving `{0}`")]
    CyclicHierarchy(String),
    #[error("unresolved type reference inside `{0}`")]
    Unresolved(String),
    #[error("`{class}` declares interface `{iface}` but does not implement `{method}`")]
    MissingInterfaceImpl {
        class: String,
        iface: String,
        method: String,
    },
    #[error("[nativeSize] class `{0}` must declare no fields")]
    NativeSizeWithFields(String),
    #[error("[nativeSize] on `{0}` must be a positive integer")]
    BadNativeSize(String),
    #[error("value-type layout cycle involving `{0}`")]
    ValueTypeCycle(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

pub struct Linker;

impl Linker {
    /// Links every class in the registry. Idempotent per class: flags guard
    /// against repeated work, which also lets lazily synthesized classes be
    /// linked one at a time later.
    pub fn link(registry: &mut Registry) -> LinkResult<()> {
        let count = registry.class_count();
        for id in registry.class_ids().collect::<Vec<_>>() {
            check_hierarchy_cycle(registry, id, count)?;
        }
        for id in registry.class_ids().collect::<Vec<_>>() {
            registry.link_class(id)?;
        }
        debug!("linked {} classes", count);
        Ok(())
    }
}

fn check_hierarchy_cycle(registry: &Registry, start: ClassId, limit: usize) -> LinkResult<()> {
    let mut cursor = registry.class(start).base.as_ref().and_then(|b| b.resolved);
    let mut steps = 0usize;
    while let Some(base) = cursor {
        if base == start || steps > limit {
            return Err(LinkError::CyclicHierarchy(
                registry.class(start).flat_name.to_string(),
            ));
        }
        steps += 1;
        cursor = registry.class(base).base.as_ref().and_then(|b| b.resolved);
    }
    Ok(())
}

fn align_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) / alignment * alignment
}

impl Registry {
    /// Finalize + layout + attribute borrowing for one class. Used by the
    /// full link pass and by lazy synthesis (boxed classes).
    pub fn link_class(&mut self, id: ClassId) -> LinkResult<()> {
        self.add_ptr_wrapper_members(id);
        self.finalize_methods(id)?;
        self.calc_layout(id, &mut Vec::new())?;
        self.borrow_attributes(id);
        Ok(())
    }

    /// `[ptrWrapper]` classes wrap an embedder-owned native pointer: a
    /// hidden `m_ptr` field plus a ctor/dtor pair bound to the
    /// `_so_%CLASS%_ctorImpl` / `_so_%CLASS%_dtorImpl` entry points the
    /// embedder must register.
    pub(crate) fn add_ptr_wrapper_members(&mut self, id: ClassId) {
        use crate::member::Field;
        use crate::method::{ECallDesc, Signature, SpecialMethod};
        use crate::typeref::TypeRef;

        if self.class(id).attribute(well_known_attrs::PTR_WRAPPER).is_none()
            || self.class(id).member_kind("m_ptr").is_some()
        {
            return;
        }
        let class_name = self.class(id).flat_name.clone();

        let ptr_field = Field::new("m_ptr", self.resolved_prim_ref(PrimType::IntPtr)).private();
        self.class_mut(id)
            .name_set
            .insert(ptr_field.name.clone(), crate::member::MemberKind::InstanceField);
        self.class_mut(id).instance_fields.push(ptr_field);

        let ctor = self.new_method(id, "create", Signature::new(vec![], self.class_ref(id)));
        self.method_mut(ctor).special = SpecialMethod::Native;
        self.method_mut(ctor).ecall = ECallDesc {
            entry_point: Some(format!("_so_{}_ctorImpl", class_name).into()),
            ..ECallDesc::default()
        };
        self.register_instance_ctor(id, ctor);

        let dtor = self.new_method(id, "destroy", Signature::new(vec![], TypeRef::void()));
        self.method_mut(dtor).kind = crate::method::MethodKind::Dtor;
        self.method_mut(dtor).special = SpecialMethod::Native;
        self.method_mut(dtor).ecall = ECallDesc {
            entry_point: Some(format!("_so_{}_dtorImpl", class_name).into()),
            ..ECallDesc::default()
        };
        self.class_mut(id).instance_dtor = Some(dtor);
    }

    /// Copies the base class's instance methods into this class's list
    /// except those overridden here, preserving base ordering so inherited
    /// vtable indices stay stable; assigns consecutive indices to new
    /// methods starting from the base count.
    pub(crate) fn finalize_methods(&mut self, id: ClassId) -> LinkResult<()> {
        if self.class(id).is_method_list_finalized() {
            return Ok(());
        }

        let base = self.class(id).base.as_ref().and_then(|b| b.resolved);
        if let Some(base) = base {
            self.finalize_methods(base)?;
        }

        let declared = self.class(id).instance_methods.clone();
        let mut merged = Vec::new();
        let mut used_as_override = vec![false; declared.len()];

        if let Some(base) = base {
            for &base_method in &self.class(base).instance_methods.clone() {
                let base_index = self.method(base_method).vtable_index();
                let override_slot = declared.iter().position(|&own| {
                    self.method(own).overrides(self.method(base_method))
                });
                match override_slot {
                    Some(slot) => {
                        let own = declared[slot];
                        used_as_override[slot] = true;
                        self.method(own).set_vtable_index(base_index);
                        merged.push(own);
                    }
                    None => merged.push(base_method),
                }
            }
        }

        let mut next_index = merged.len() as i32;
        for (slot, &own) in declared.iter().enumerate() {
            if used_as_override[slot] {
                continue;
            }
            self.method(own).set_vtable_index(next_index);
            next_index += 1;
            merged.push(own);
        }

        self.class_mut(id).instance_methods = merged;

        // Record impls for every method of every declared interface.
        for iface_ref in self.class(id).interfaces.clone() {
            let iface = iface_ref
                .resolved
                .ok_or_else(|| LinkError::Unresolved(self.class(id).flat_name.to_string()))?;
            self.finalize_methods(iface)?;
            for &iface_method in &self.class(iface).instance_methods.clone() {
                let im_name = self.method(iface_method).name.clone();
                let found = self
                    .instance_method_by_name(id, &im_name)
                    .filter(|&own| self.method(own).sig.matches(&self.method(iface_method).sig));
                match found {
                    Some(own) => {
                        self.class(id).iface_impl_cache.insert(iface_method, own);
                    }
                    None => {
                        return Err(LinkError::MissingInterfaceImpl {
                            class: self.class(id).flat_name.to_string(),
                            iface: self.class(iface).flat_name.to_string(),
                            method: im_name.to_string(),
                        })
                    }
                }
            }
        }

        self.class_mut(id).flags |= ClassFlags::METHODLIST_FINALIZED;
        Ok(())
    }

    /// Walks instance fields in declaration order after inherited fields,
    /// pointer-aligning every field, recording reference offsets into the
    /// GC map and recursively embedding value-type maps.
    pub(crate) fn calc_layout(&mut self, id: ClassId, in_progress: &mut Vec<ClassId>) -> LinkResult<()> {
        if self.class(id).is_size_calculated() {
            return Ok(());
        }
        if in_progress.contains(&id) {
            return Err(LinkError::ValueTypeCycle(
                self.class(id).flat_name.to_string(),
            ));
        }
        in_progress.push(id);

        // [nativeSize=N] forces an opaque blob.
        let native_size = self
            .class(id)
            .int_attribute(well_known_attrs::NATIVE_SIZE)
            .map_err(|_| LinkError::BadNativeSize(self.class(id).flat_name.to_string()))?;
        if let Some(n) = native_size {
            let class = self.class_mut(id);
            if !class.instance_fields.is_empty() {
                return Err(LinkError::NativeSizeWithFields(class.flat_name.to_string()));
            }
            if n <= 0 {
                return Err(LinkError::BadNativeSize(class.flat_name.to_string()));
            }
            class.special = SpecialClass::BinaryBlob;
            class.gc.content_size = n as usize;
            class.gc.size_for_use = n as usize;
            class.flags |= ClassFlags::SIZE_CALCULATED;
            in_progress.pop();
            return Ok(());
        }

        // Classes with a verbatim struct def are pre-sized at synthesis.
        if self.class(id).struct_def.is_some() {
            debug_assert!(
                self.class(id).gc.content_size != 0,
                "struct_def class {} must be pre-sized",
                self.class(id).flat_name
            );
            self.class_mut(id).flags |= ClassFlags::SIZE_CALCULATED;
            in_progress.pop();
            return Ok(());
        }

        let is_value = self.class(id).is_value_type();
        let base = self.class(id).base.as_ref().and_then(|b| b.resolved);

        let mut offset = 0usize;
        let mut map = Vec::new();
        if !is_value {
            // Header word, then inherited content. Foreign proxies inherit
            // only for vtable compatibility; their layout is the fixed
            // (handle, name) header the runtime and the GC rely on.
            offset = PTR_SIZE;
            if self.class(id).special != SpecialClass::Foreign {
                if let Some(base) = base {
                    self.calc_layout(base, in_progress)?;
                    let base_gc = &self.class(base).gc;
                    offset = offset.max(base_gc.content_size);
                    map.extend_from_slice(&base_gc.map);
                }
            }
        }

        let field_count = self.class(id).instance_fields.len();
        for i in 0..field_count {
            let field_ty = self.class(id).instance_fields[i].ty.clone();
            offset = align_up(offset, PTR_SIZE);

            let field_size = match field_ty.prim {
                PrimType::Object => {
                    let field_class = field_ty
                        .resolved
                        .ok_or_else(|| LinkError::Unresolved(self.class(id).flat_name.to_string()))?;
                    if self.class(field_class).is_value_type() {
                        self.calc_layout(field_class, in_progress)?;
                        let inner = &self.class(field_class).gc;
                        for &inner_off in &inner.map {
                            map.push(offset + inner_off);
                        }
                        inner.content_size
                    } else {
                        map.push(offset);
                        PTR_SIZE
                    }
                }
                prim => prim.byte_size(),
            };

            self.class_mut(id).instance_fields[i].offset = offset;
            offset += field_size;
        }

        let content_size = align_up(offset.max(if is_value { 0 } else { PTR_SIZE }), PTR_SIZE);

        // Statics get their own block layout; ref offsets are derived from
        // the field types when the runtime registers roots.
        let mut static_offset = 0usize;
        let static_count = self.class(id).static_fields.len();
        for i in 0..static_count {
            static_offset = align_up(static_offset, PTR_SIZE);
            let field_ty = self.class(id).static_fields[i].ty.clone();
            let size = match field_ty.prim {
                PrimType::Object => {
                    let field_class = field_ty
                        .resolved
                        .ok_or_else(|| LinkError::Unresolved(self.class(id).flat_name.to_string()))?;
                    if self.class(field_class).is_value_type() {
                        self.calc_layout(field_class, in_progress)?;
                        self.class(field_class).gc.content_size
                    } else {
                        PTR_SIZE
                    }
                }
                prim => prim.byte_size(),
            };
            self.class_mut(id).static_fields[i].offset = static_offset;
            static_offset += size;
        }

        {
            let class = self.class_mut(id);
            class.gc.map = map;
            class.gc.content_size = content_size;
            class.gc.size_for_use = if is_value { content_size } else { PTR_SIZE };
            class.static_size = align_up(static_offset, PTR_SIZE);
            class.flags |= ClassFlags::SIZE_CALCULATED;
        }
        in_progress.pop();
        Ok(())
    }

    /// Recursively borrows attributes from base classes unless this class
    /// already carries an attribute with the same name.
    pub(crate) fn borrow_attributes(&mut self, id: ClassId) {
        if self.class(id).flags.contains(ClassFlags::ATTRIBUTES_BORROWED) {
            return;
        }
        if let Some(base) = self.class(id).base.as_ref().and_then(|b| b.resolved) {
            self.borrow_attributes(base);
            let inherited: Vec<_> = self
                .class(base)
                .attributes
                .iter()
                .filter(|a| self.class(id).attribute(&a.name).is_none())
                .cloned()
                .collect();
            self.class_mut(id).attributes.extend(inherited);
        }
        self.class_mut(id).flags |= ClassFlags::ATTRIBUTES_BORROWED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{Attribute, Field};
    use crate::method::Signature;
    use crate::typeref::TypeRef;

    fn resolved_ref(registry: &Registry, name: &str) -> TypeRef {
        let mut tr = TypeRef::object(name);
        tr.resolved = registry.class_by_name(name);
        tr
    }

    #[test]
    fn test_inherited_vtable_indices_are_stable() {
        let mut registry = Registry::new();
        let base = registry.new_class("Base");
        let a = registry.new_method(base, "a", Signature::new(vec![], TypeRef::void()));
        let b = registry.new_method(base, "b", Signature::new(vec![], TypeRef::void()));
        registry.register_instance_method(base, a);
        registry.register_instance_method(base, b);

        let derived = registry.new_class("Derived");
        registry.class_mut(derived).base = Some(resolved_ref(&registry, "Base"));
        let b_override = registry.new_method(derived, "b", Signature::new(vec![], TypeRef::void()));
        let c = registry.new_method(derived, "c", Signature::new(vec![], TypeRef::void()));
        registry.register_instance_method(derived, b_override);
        registry.register_instance_method(derived, c);

        Linker::link(&mut registry).unwrap();

        assert_eq!(registry.method(a).vtable_index(), 0);
        assert_eq!(registry.method(b).vtable_index(), 1);
        // The override occupies the base slot; the new method extends.
        assert_eq!(registry.method(b_override).vtable_index(), 1);
        assert_eq!(registry.method(c).vtable_index(), 2);
        assert_eq!(registry.class(derived).instance_methods.len(), 3);
    }

    #[test]
    fn test_cycle_detected() {
        let mut registry = Registry::new();
        let a = registry.new_class("A");
        let b = registry.new_class("B");
        let mut a_ref = TypeRef::object("A");
        a_ref.resolved = Some(a);
        let mut b_ref = TypeRef::object("B");
        b_ref.resolved = Some(b);
        registry.class_mut(a).base = Some(b_ref);
        registry.class_mut(b).base = Some(a_ref);
        assert!(matches!(
            Linker::link(&mut registry),
            Err(LinkError::CyclicHierarchy(_))
        ));
    }

    #[test]
    fn test_gc_map_offsets() {
        let mut registry = Registry::new();
        let holder = registry.new_class("Holder");
        registry.class_mut(holder).instance_fields = vec![
            Field::new("count", TypeRef::prim(crate::typeref::PrimType::Int)),
            Field::new("name", resolved_ref(&registry, "string")),
            Field::new("err", resolved_ref(&registry, "Error")),
        ];
        Linker::link(&mut registry).unwrap();

        let class = registry.class(holder);
        // header(8) + int(aligned 8..12 -> next aligns to 16) -> name@16, err@24
        assert_eq!(class.instance_fields[0].offset, PTR_SIZE);
        assert_eq!(class.instance_fields[1].offset, 2 * PTR_SIZE);
        assert_eq!(class.instance_fields[2].offset, 3 * PTR_SIZE);
        assert_eq!(class.gc.map, vec![2 * PTR_SIZE, 3 * PTR_SIZE]);
        assert_eq!(class.gc.content_size, 4 * PTR_SIZE);
        assert_eq!(class.gc.size_for_use, PTR_SIZE);
    }

    #[test]
    fn test_value_type_embedding() {
        let mut registry = Registry::new();
        let point = registry.new_class("Point");
        registry.class_mut(point).flags |= ClassFlags::VALUETYPE;
        registry.class_mut(point).instance_fields = vec![
            Field::new("label", resolved_ref(&registry, "string")),
            Field::new("x", TypeRef::prim(crate::typeref::PrimType::Int)),
        ];

        let shape = registry.new_class("Shape");
        let mut point_ref = TypeRef::object("Point");
        point_ref.resolved = Some(point);
        registry.class_mut(shape).instance_fields = vec![
            Field::new("origin", point_ref),
            Field::new("tag", resolved_ref(&registry, "string")),
        ];
        Linker::link(&mut registry).unwrap();

        let point_class = registry.class(point);
        assert_eq!(point_class.gc.map, vec![0]);
        assert_eq!(point_class.gc.content_size, 2 * PTR_SIZE);
        assert_eq!(point_class.gc.size_for_use, 2 * PTR_SIZE);

        let shape_class = registry.class(shape);
        // origin embedded at 8 (its string at 8+0), tag at 24.
        assert_eq!(shape_class.instance_fields[0].offset, PTR_SIZE);
        assert_eq!(shape_class.gc.map, vec![PTR_SIZE, 3 * PTR_SIZE]);
    }

    #[test]
    fn test_native_size_blob() {
        let mut registry = Registry::new();
        let blob = registry.new_class("NativeBuf");
        registry.class_mut(blob).flags |= ClassFlags::VALUETYPE;
        registry
            .class_mut(blob)
            .attributes
            .push(Attribute::new("nativeSize", "24"));
        Linker::link(&mut registry).unwrap();
        let class = registry.class(blob);
        assert_eq!(class.special, SpecialClass::BinaryBlob);
        assert_eq!(class.gc.content_size, 24);
        assert!(class.gc.map.is_empty());
    }

    #[test]
    fn test_ptr_wrapper_members() {
        let mut registry = Registry::new();
        let wrapper = registry.new_class("FileHandle");
        registry
            .class_mut(wrapper)
            .attributes
            .push(Attribute::new("ptrWrapper", ""));
        Linker::link(&mut registry).unwrap();

        let class = registry.class(wrapper);
        assert_eq!(&*class.instance_fields[0].name, "m_ptr");
        assert!(class.instance_dtor.is_some());
        let ctor = class.instance_ctors[0];
        assert_eq!(
            registry.method(ctor).ecall.entry_point.as_deref(),
            Some("_so_FileHandle_ctorImpl")
        );
        let dtor = class.instance_dtor.unwrap();
        assert_eq!(
            registry.method(dtor).ecall.entry_point.as_deref(),
            Some("_so_FileHandle_dtorImpl")
        );
    }

    #[test]
    fn test_attribute_borrowing() {
        let mut registry = Registry::new();
        let base = registry.new_class("Base");
        registry
            .class_mut(base)
            .attributes
            .push(Attribute::new("serializable", "true"));
        registry
            .class_mut(base)
            .attributes
            .push(Attribute::new("version", "1"));
        let derived = registry.new_class("Derived");
        let mut base_ref = TypeRef::object("Base");
        base_ref.resolved = Some(base);
        registry.class_mut(derived).base = Some(base_ref);
        registry
            .class_mut(derived)
            .attributes
            .push(Attribute::new("version", "2"));
        Linker::link(&mut registry).unwrap();

        let derived_class = registry.class(derived);
        assert_eq!(derived_class.attribute("serializable").map(|a| &*a.value), Some("true"));
        // Own attribute wins over the borrowed one.
        assert_eq!(derived_class.attribute("version").map(|a| &*a.value), Some("2"));
    }
}
