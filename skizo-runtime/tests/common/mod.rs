// Shared scaffolding for the runtime integration suites: a frontend that
// builds metadata programmatically (standing in for the external parser)
// and binds natively implemented method bodies.

#![allow(dead_code)]

use std::rc::Rc;

use skizo_meta::{MethodId, Registry};
use skizo_runtime::{Domain, Frontend, SourceRef};

/// A frontend backed by plain function pointers so it stays `Send`.
pub struct TestFrontend {
    pub build: fn(&mut Registry),
    pub bind: fn(&Rc<Domain>),
}

impl TestFrontend {
    pub fn new(build: fn(&mut Registry)) -> Self {
        Self {
            build,
            bind: |_| {},
        }
    }

    pub fn with_bind(build: fn(&mut Registry), bind: fn(&Rc<Domain>)) -> Self {
        Self { build, bind }
    }
}

impl Frontend for TestFrontend {
    fn parse(&self, _source: &SourceRef, registry: &mut Registry) -> anyhow::Result<()> {
        (self.build)(registry);
        Ok(())
    }

    fn bind(&self, domain: &Rc<Domain>) -> anyhow::Result<()> {
        (self.bind)(domain);
        Ok(())
    }
}

/// Finds a method on a named class, instance lists first.
pub fn find_method(domain: &Domain, class_name: &str, method_name: &str) -> MethodId {
    let registry = domain.registry().borrow();
    let class = registry
        .class_by_name(class_name)
        .unwrap_or_else(|| panic!("no class {class_name}"));
    registry
        .instance_method_by_name(class, method_name)
        .or_else(|| registry.static_method_by_name(class, method_name))
        .unwrap_or_else(|| panic!("no method {class_name}::{method_name}"))
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
