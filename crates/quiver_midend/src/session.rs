use crate::error::Error;
use quiver_common::config::PassOptions;
use quiver_common::data::typed_ir::{TypedFn, VarName};
use quiver_common::data::types::FuncName;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::trace;

/// All state shared between passes during one compilation.
///
/// The name counter, function registry and pass cache are append-only: names are never reused and
/// published definitions are never replaced, so an `Rc<TypedFn>` handed out once stays valid (and
/// current) for the lifetime of the session.  Independent compilations use independent sessions.
#[derive(Debug)]
pub struct Session {
    next_name: u64,
    functions: BTreeMap<FuncName, Rc<TypedFn>>,
    pass_cache: BTreeMap<(String, FuncName), Rc<TypedFn>>,
    pub options: PassOptions,
}

// Strip a previous ".N" suffix so that refreshing a name does not grow it without bound.
fn stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, suffix)) if !stem.is_empty() && suffix.bytes().all(|c| c.is_ascii_digit()) => {
            stem
        }
        _ => name,
    }
}

impl Session {
    pub fn new(options: PassOptions) -> Self {
        Session {
            next_name: 0,
            functions: BTreeMap::new(),
            pass_cache: BTreeMap::new(),
            options,
        }
    }

    pub fn fresh(&mut self, prefix: &str) -> String {
        let id = self.next_name;
        self.next_name += 1;
        format!("{}.{}", stem(prefix), id)
    }

    pub fn fresh_var(&mut self, prefix: &str) -> VarName {
        VarName(self.fresh(prefix))
    }

    pub fn refresh_var(&mut self, old: &VarName) -> VarName {
        VarName(self.fresh(&old.0))
    }

    pub fn refresh_fn(&mut self, old: &FuncName) -> FuncName {
        FuncName(self.fresh(&old.0))
    }

    pub fn register(&mut self, func: TypedFn) -> Result<Rc<TypedFn>, Error> {
        if self.functions.contains_key(&func.name) {
            return Err(Error::DuplicateFunction(func.name));
        }
        trace!(func = %func.name, "registered");
        let func = Rc::new(func);
        self.functions.insert(func.name.clone(), func.clone());
        Ok(func)
    }

    pub fn lookup(&self, name: &FuncName) -> Result<Rc<TypedFn>, Error> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFunction(name.clone()))
    }

    pub fn cached(&self, pass_key: &str, source: &FuncName) -> Option<Rc<TypedFn>> {
        self.pass_cache
            .get(&(pass_key.to_owned(), source.clone()))
            .cloned()
    }

    pub fn insert_cached(&mut self, pass_key: String, source: FuncName, result: Rc<TypedFn>) {
        let previous = self.pass_cache.insert((pass_key, source), result);
        debug_assert!(previous.is_none(), "pass cache entries are insert-once");
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new(PassOptions::default())
    }
}
