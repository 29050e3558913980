// Snapshots: a self-describing binary serialization of an object tree
// rooted at a single reference object. 4-byte size header (total bytes,
// header included), 6-byte magic, then a recursive property dump driven by
// the getter/setter convention.

use std::io::{Read, Write};

use skizo_diagnostics::{HostError, HostResult};
use skizo_meta::{PrimType, SpecialClass};

use crate::abort::abort_with_message;
use crate::domain::Domain;
use crate::object::{so_class_of, GcPtr};
use crate::reflection::{get_properties, invoke_raw};

pub const SNAPSHOT_MAGIC: &[u8; 6] = b"SNPSH1";
const CORRUPT: &str = "Corrupt snapshot.";

const ROOT_REJECT: &str =
    "Valuetypes, binary blobs, closures, foreign objects, failables not supported.";
const PROP_REJECT: &str =
    "Binary blobs, closures, foreign objects, failables not supported as properties.";

fn append_name(out: &mut Vec<u8>, name: &str) {
    let chars: Vec<u16> = name.encode_utf16().collect();
    out.extend_from_slice(&(chars.len() as i32).to_ne_bytes());
    for c in chars {
        out.extend_from_slice(&c.to_ne_bytes());
    }
}

/// Serializes the object tree. The root must be a plain reference object.
pub fn snapshot_create(domain: &Domain, obj: GcPtr) -> Vec<u8> {
    if obj.is_null() {
        abort_with_message(ROOT_REJECT);
    }
    let class = unsafe { so_class_of(obj) };
    if class.special != SpecialClass::None || class.is_value_type() {
        abort_with_message(ROOT_REJECT);
    }

    let mut out = Vec::with_capacity(64);
    // Space for the size header, injected at the end.
    out.extend_from_slice(&0i32.to_ne_bytes());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    do_object(domain, obj, &mut out);

    let size = out.len() as i32;
    out[..4].copy_from_slice(&size.to_ne_bytes());
    out
}

fn do_object(domain: &Domain, obj: GcPtr, out: &mut Vec<u8>) {
    let class = unsafe { so_class_of(obj) };
    if class.special != SpecialClass::None {
        abort_with_message(PROP_REJECT);
    }

    let nice_name = domain.registry().borrow().nice_name(class.id);
    append_name(out, &nice_name);

    let props = {
        let registry = domain.registry().borrow();
        get_properties(&registry, class.id, false)
    };
    // Only full getter/setter pairs survive a round trip; the setter name
    // is what the loader dispatches on.
    let pairs: Vec<_> = props.into_iter().filter(|p| p.setter.is_some()).collect();
    out.extend_from_slice(&(pairs.len() as i32).to_ne_bytes());

    for prop in pairs {
        let (setter_name, ret_ty) = {
            let registry = domain.registry().borrow();
            let setter = prop.setter.unwrap_or(prop.getter);
            (
                registry.method(setter).name.to_string(),
                registry.method(prop.getter).sig.ret.clone(),
            )
        };
        append_name(out, &setter_name);

        let mut words: Vec<*mut u8> = vec![obj];
        let result = invoke_raw(domain, prop.getter, &mut words);

        let registry = domain.registry().borrow();
        let static_class = match ret_ty.resolved {
            Some(id) => id,
            None => abort_with_message(PROP_REJECT),
        };

        if registry.class(static_class).is_value_type() {
            // Value results are written embedded, named by the value class
            // (the boxed form reports its wrapped class).
            let nice = registry.nice_name(static_class);
            let size = registry.class(static_class).gc.content_size;
            let prim = registry.class(static_class).prim;
            drop(registry);
            append_name(out, &nice);
            match prim {
                PrimType::Int | PrimType::Bool => out.extend_from_slice(
                    &crate::thunks::word_to_i32(result).to_ne_bytes()[..size.min(4)],
                ),
                PrimType::Float => {
                    out.extend_from_slice(&crate::thunks::word_to_f32(result).to_ne_bytes())
                }
                PrimType::Char => {
                    out.extend_from_slice(&(result as usize as u16).to_ne_bytes())
                }
                _ => {
                    if result.is_null() {
                        out.extend(std::iter::repeat(0u8).take(size));
                    } else {
                        let bytes =
                            unsafe { std::slice::from_raw_parts(result as *const u8, size) };
                        out.extend_from_slice(bytes);
                    }
                }
            }
        } else if result.is_null() {
            // Null sentinel: the declared class name followed by a zeroed
            // pointer-sized payload.
            let nice = registry.nice_name(static_class);
            drop(registry);
            append_name(out, &nice);
            out.extend_from_slice(&0usize.to_ne_bytes());
        } else {
            // The actual object may be a subclass of the declared type.
            let dynamic = unsafe { so_class_of(result) };
            let nice = registry.nice_name(dynamic.id);
            drop(registry);
            append_name(out, &nice);
            do_object(domain, result, out);
        }
    }
}

// ----------------------------------------------------------------------
// Structural decode. The original left the object-materializing load path
// unimplemented; the port decodes into a structural tree instead.
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotNode {
    pub class_name: String,
    pub properties: Vec<(String, SnapshotValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotValue {
    Embedded { class_name: String, bytes: Vec<u8> },
    Null { class_name: String },
    Object(SnapshotNode),
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> HostResult<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.at..self.at + n)
            .ok_or_else(|| HostError::BadFormat(CORRUPT.into()))?;
        self.at += n;
        Ok(slice)
    }

    fn read_i32(&mut self) -> HostResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_name(&mut self) -> HostResult<String> {
        let count = self.read_i32()?;
        if !(0..=0xFFFF).contains(&count) {
            return Err(HostError::BadFormat(CORRUPT.into()));
        }
        let raw = self.take(count as usize * 2)?;
        let chars: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&chars))
    }
}

/// Decodes a snapshot buffer into its structural tree. Needs the domain's
/// registry to size embedded value payloads.
pub fn snapshot_to_tree(domain: &Domain, bytes: &[u8]) -> HostResult<SnapshotNode> {
    if bytes.len() < 10 || &bytes[4..10] != SNAPSHOT_MAGIC {
        return Err(HostError::BadFormat(CORRUPT.into()));
    }
    let declared = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if declared <= 0 || declared as usize != bytes.len() {
        return Err(HostError::BadFormat(CORRUPT.into()));
    }
    let mut reader = Reader { bytes, at: 10 };
    read_node(domain, &mut reader)
}

fn read_node(domain: &Domain, reader: &mut Reader) -> HostResult<SnapshotNode> {
    let class_name = reader.read_name()?;
    let prop_count = reader.read_i32()?;
    if prop_count < 0 {
        return Err(HostError::BadFormat(CORRUPT.into()));
    }
    let mut properties = Vec::with_capacity(prop_count as usize);
    for _ in 0..prop_count {
        let setter = reader.read_name()?;
        let value_class = reader.read_name()?;
        let value = {
            let registry = domain.registry().borrow();
            let known = registry.class_by_nice_name(&value_class);
            match known {
                Some(id) if registry.class(id).is_value_type() => {
                    let class = registry.class(id);
                    let width = match class.prim {
                        PrimType::Int | PrimType::Bool | PrimType::Float => 4,
                        PrimType::Char => 2,
                        _ => class.gc.content_size,
                    };
                    drop(registry);
                    SnapshotValue::Embedded {
                        class_name: value_class,
                        bytes: reader.take(width)?.to_vec(),
                    }
                }
                _ => {
                    drop(registry);
                    // A zeroed pointer-sized payload is the null sentinel;
                    // anything else is a nested object.
                    let peek = reader
                        .bytes
                        .get(reader.at..reader.at + std::mem::size_of::<usize>());
                    if peek.map(|p| p.iter().all(|&b| b == 0)).unwrap_or(false) {
                        reader.take(std::mem::size_of::<usize>())?;
                        SnapshotValue::Null {
                            class_name: value_class,
                        }
                    } else {
                        SnapshotValue::Object(read_node(domain, reader)?)
                    }
                }
            }
        };
        properties.push((setter, value));
    }
    Ok(SnapshotNode {
        class_name,
        properties,
    })
}

// ----------------------------------------------------------------------
// File IO, gated by the file permission.
// ----------------------------------------------------------------------

pub fn snapshot_save_to_file(domain: &Domain, bytes: &[u8], path: &str) {
    domain.security().borrow().demand_file_io_permission(path);
    let full = domain.security().borrow().full_path(path);
    let result = std::fs::File::create(&full).and_then(|mut f| f.write_all(bytes));
    if let Err(err) = result {
        abort_with_message(format!("Cannot save snapshot: {}.", err));
    }
}

pub fn snapshot_load_from_file(domain: &Domain, path: &str) -> Vec<u8> {
    domain.security().borrow().demand_file_io_permission(path);
    let full = domain.security().borrow().full_path(path);
    let mut file = match std::fs::File::open(&full) {
        Ok(file) => file,
        Err(_) => abort_with_message(CORRUPT),
    };

    let mut header = [0u8; 10];
    if file.read_exact(&mut header).is_err() || &header[4..10] != SNAPSHOT_MAGIC {
        abort_with_message(CORRUPT);
    }
    let size = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
    if size <= 10 {
        abort_with_message(CORRUPT);
    }

    // Allocate only after the magic check, so a corrupt size field cannot
    // drive a huge allocation.
    let content_size = size as usize - 10;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&header);
    let mut content = vec![0u8; content_size];
    if file.read_exact(&mut content).is_err() {
        abort_with_message(CORRUPT);
    }
    out.extend_from_slice(&content);
    out
}
