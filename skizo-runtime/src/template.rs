// `{field.subfield}`-style string templates bound to a target class. A
// template is parsed once; rendering walks each bound call chain from the
// rendered object and appends `toString()` conversions of the results.

use std::cell::RefCell;
use std::collections::HashMap;

use skizo_meta::{ClassId, MethodId, MethodKind, PrimType, Registry, SpecialClass, TypeRef};

use crate::abort::abort_with_message;
use crate::domain::Domain;
use crate::object::{so_class_of, GcPtr, StringHeader};
use crate::reflection::invoke_raw;
use crate::strings::sostr_clone_raw;

const WRONG_TYPE: &str = "The rendered object is of a wrong type.";

/// A chain segment: a property-like method, or the class's `get` method
/// bound to a literal argument.
#[derive(Debug, Clone)]
enum TemplateArg {
    None,
    Int(i32),
    Str(String),
}

#[derive(Debug, Clone)]
struct MethodWithArgument {
    method: MethodId,
    arg: TemplateArg,
}

#[derive(Debug)]
enum TemplatePart {
    Literal(String),
    Chain(Vec<MethodWithArgument>),
}

#[derive(Debug)]
pub struct Template {
    class: ClassId,
    parts: Vec<TemplatePart>,
    /// Function-pointer retrieval is slow (and under the emitter lock for
    /// lazily compiled thunks); resolved `toString`s are cached per class.
    to_string_cache: RefCell<HashMap<ClassId, MethodId>>,
    /// One reusable builder per template.
    builder: RefCell<String>,
}

// ----------------------------------------------------------------------
// Parsing.
// ----------------------------------------------------------------------

/// Abstract, static and most special classes cannot be rendered.
fn is_renderable_class(registry: &Registry, class: ClassId) -> bool {
    let c = registry.class(class);
    if c.is_abstract() || c.is_static() {
        return false;
    }
    matches!(
        c.special,
        SpecialClass::None | SpecialClass::Array | SpecialClass::Failable | SpecialClass::MethodClass
    )
}

/// Splits a placeholder on spaces, honoring single-quoted segments. Quotes
/// must be surrounded by spaces and balanced.
fn split_placeholder(source: &str) -> Vec<String> {
    let chars: Vec<char> = source.chars().collect();
    let mut result = Vec::new();
    let mut last_index = 0usize;
    let mut quote = false;

    for (i, &c) in chars.iter().enumerate() {
        if !quote && c == ' ' {
            if i != last_index {
                result.push(chars[last_index..i].iter().collect());
            }
            last_index = i + 1;
        } else if c == '\'' {
            if !quote && i > 0 && chars[i - 1] != ' ' {
                abort_with_message("A space required before a quote.");
            } else if quote && i < chars.len() - 1 && chars[i + 1] != ' ' {
                abort_with_message("A space is required after a quote.");
            }
            quote = !quote;
        }
    }
    if quote {
        abort_with_message("Unclosed quotation.");
    }
    if chars.len() != last_index {
        result.push(chars[last_index..].iter().collect());
    }
    result
}

fn parse_single_quoted(elem: &str) -> Option<String> {
    let chars: Vec<char> = elem.chars().collect();
    if chars.len() < 3 || chars[0] != '\'' || chars[chars.len() - 1] != '\'' {
        return None;
    }
    let inner = &chars[1..chars.len() - 1];
    if inner.contains(&'\'') {
        return None;
    }
    Some(inner.iter().collect())
}

/// `int` and `string` both implement `any` and `MapKey`; `get` methods
/// keyed on those generic interfaces are accepted too.
fn is_suitable_get_argument(registry: &Registry, class: ClassId, param_class_name: &str) -> bool {
    let flat = &*registry.class(class).flat_name;
    flat == param_class_name || flat == "any" || flat == "MapKey"
}

fn get_method_for_class(registry: &Registry, class: ClassId, param_class_name: &str) -> MethodId {
    let Some(method) = registry.my_method(class, "get", MethodKind::Normal) else {
        abort_with_message("No `get` method found.");
    };
    let m = registry.method(method);
    let suitable = m.sig.params.len() == 1
        && !m.sig.ret.is_void()
        && m.sig.params[0]
            .ty
            .resolved
            .map(|p| is_suitable_get_argument(registry, p, param_class_name))
            .unwrap_or(false);
    if !suitable {
        abort_with_message("Object has no method `get` with an appropriate signature.");
    }
    method
}

/// A quoted string or an integer dispatches to `get`; {0} is (get 0).
fn try_get_with_argument(
    registry: &Registry,
    class: ClassId,
    elem: &str,
) -> Option<MethodWithArgument> {
    if let Ok(int_arg) = elem.parse::<i32>() {
        let method = get_method_for_class(registry, class, "int");
        return Some(MethodWithArgument {
            method,
            arg: TemplateArg::Int(int_arg),
        });
    }
    if let Some(string_arg) = parse_single_quoted(elem) {
        let method = get_method_for_class(registry, class, "string");
        return Some(MethodWithArgument {
            method,
            arg: TemplateArg::Str(string_arg),
        });
    }
    None
}

fn parse_chain(registry: &Registry, class: ClassId, placeholder: &str) -> Vec<MethodWithArgument> {
    let elems = split_placeholder(placeholder);
    if elems.is_empty() {
        abort_with_message("Empty placeholder not allowed.");
    }

    let mut chain = Vec::with_capacity(elems.len());
    let mut cursor = class;
    for elem in &elems {
        let bound = match try_get_with_argument(registry, cursor, elem) {
            Some(bound) => bound,
            None => {
                let Some(method) = registry.my_method(cursor, elem, MethodKind::Normal) else {
                    abort_with_message("Unknown method.");
                };
                let m = registry.method(method);
                if !m.sig.params.is_empty() || m.sig.ret.is_void() {
                    abort_with_message("Placeholder refers to a method which is not property-like.");
                }
                MethodWithArgument {
                    method,
                    arg: TemplateArg::None,
                }
            }
        };
        cursor = registry
            .method(bound.method)
            .sig
            .ret
            .resolved
            .unwrap_or(cursor);
        chain.push(bound);
    }
    chain
}

impl Template {
    /// Builds a template once from a source string and a target class.
    pub fn parse(registry: &Registry, source: &str, class: ClassId) -> Template {
        if !is_renderable_class(registry, class) {
            abort_with_message("The class is not renderable.");
        }

        let chars: Vec<char> = source.chars().collect();
        let mut parts = Vec::new();
        let mut last_index = 0usize;
        let mut in_placeholder = false;

        for (i, &c) in chars.iter().enumerate() {
            if c == '{' {
                if in_placeholder {
                    abort_with_message("nested '{' not allowed");
                }
                if i != last_index {
                    parts.push(TemplatePart::Literal(chars[last_index..i].iter().collect()));
                }
                last_index = i + 1;
                in_placeholder = true;
            } else if c == '}' {
                if !in_placeholder {
                    abort_with_message("Nested '}' not allowed.");
                }
                let placeholder: String = chars[last_index..i].iter().collect();
                parts.push(TemplatePart::Chain(parse_chain(registry, class, &placeholder)));
                last_index = i + 1;
                in_placeholder = false;
            }
        }
        if in_placeholder {
            abort_with_message("Unclosed placeholder.");
        }
        if last_index != chars.len() {
            parts.push(TemplatePart::Literal(chars[last_index..].iter().collect()));
        }

        Template {
            class,
            parts,
            to_string_cache: RefCell::new(HashMap::new()),
            builder: RefCell::new(String::new()),
        }
    }

    /// Renders the template against an object. The object's class must be
    /// exactly the template's class.
    pub fn render(&self, domain: &Domain, obj: GcPtr) -> String {
        if obj.is_null() {
            abort_with_message(WRONG_TYPE);
        }
        let dynamic = unsafe { so_class_of(obj) };
        if dynamic.id != self.class {
            abort_with_message(WRONG_TYPE);
        }

        let mut builder = self.builder.borrow_mut();
        builder.clear();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => builder.push_str(text),
                TemplatePart::Chain(chain) => {
                    let (word, ret_ty) = self.walk_chain(domain, obj, chain);
                    if let Some(text) = self.convert_to_string(domain, word, &ret_ty) {
                        builder.push_str(&text);
                    }
                }
            }
        }
        builder.clone()
    }

    fn walk_chain(
        &self,
        domain: &Domain,
        obj: GcPtr,
        chain: &[MethodWithArgument],
    ) -> (*mut u8, TypeRef) {
        let mut current: *mut u8 = obj;
        let mut current_ty = {
            let registry = domain.registry().borrow();
            registry.class_ref(self.class)
        };

        for bound in chain {
            let mut words: Vec<*mut u8> = vec![current];
            match &bound.arg {
                TemplateArg::None => {}
                TemplateArg::Int(v) => words.push(crate::thunks::word_from_i32(*v)),
                TemplateArg::Str(s) => {
                    // The target method may retain the argument, so a real
                    // GC-managed string is required.
                    words.push(domain.create_string(s))
                }
            }
            current = invoke_raw(domain, bound.method, &mut words);
            current_ty = domain.registry().borrow().method(bound.method).sig.ret.clone();
        }
        (current, current_ty)
    }

    /// Converts the final chain value to text via the value's `toString`,
    /// returning strings directly without re-rendering.
    fn convert_to_string(&self, domain: &Domain, word: *mut u8, ty: &TypeRef) -> Option<String> {
        let registry = domain.registry().borrow();
        let string_class = registry.string_class();

        // Primitive results carry their static type.
        let value_class = ty.resolved?;
        if registry.class(value_class).is_value_type() {
            let to_string = self.resolved_to_string(&registry, value_class);
            let prim = registry.class(value_class).prim;
            drop(registry);
            // Value receivers travel by pointer in the invoker ABI; plain
            // primitives sit in the word itself, structs are already
            // indirect.
            let mut storage = word as usize;
            let receiver: *mut u8 = if prim == PrimType::Object {
                word
            } else {
                &mut storage as *mut usize as *mut u8
            };
            let mut words: Vec<*mut u8> = vec![receiver];
            let result = invoke_raw(domain, to_string, &mut words);
            return read_string(result);
        }

        if word.is_null() {
            return None;
        }
        let dynamic = unsafe { so_class_of(word) };
        if dynamic.id == string_class {
            // Most properties are strings; return them directly.
            drop(registry);
            return read_string(word);
        }
        let to_string = self.resolved_to_string(&registry, dynamic.id);
        let sig_ok = {
            let m = registry.method(to_string);
            m.sig.params.is_empty() && m.sig.ret.resolved == Some(string_class)
        };
        if !sig_ok {
            abort_with_message("Object has no method `toString` with an appropriate signature.");
        }
        drop(registry);
        let mut words: Vec<*mut u8> = vec![word];
        let result = invoke_raw(domain, to_string, &mut words);
        read_string(result)
    }

    fn resolved_to_string(&self, registry: &Registry, class: ClassId) -> MethodId {
        if let Some(&cached) = self.to_string_cache.borrow().get(&class) {
            return cached;
        }
        let Some(found) = registry.instance_method_by_name(class, "toString") else {
            abort_with_message("Object has no `toString` method.");
        };
        self.to_string_cache.borrow_mut().insert(class, found);
        found
    }
}

fn read_string(obj: *mut u8) -> Option<String> {
    if obj.is_null() {
        return None;
    }
    unsafe {
        let header = obj as *const StringHeader;
        Some(sostr_clone_raw((*header).pstr).to_utf8())
    }
}

/// Convenience wrapper mirroring the script-facing constructor.
pub fn template_for_class(domain: &Domain, source: &str, class: ClassId) -> Template {
    let registry = domain.registry().borrow();
    Template::parse(&registry, source, class)
}
