//! The environment: registries for filters, extensions, handlers, data
//! methods, and the loader, plus the render entry points.
//!
//! An environment is configured up front and read-only during render: each
//! compile takes a snapshot of the registries, and a render borrows that
//! snapshot immutably while owning all of its own mutable state.

use std::{cell::RefCell, rc::Rc};

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::{
    compile::{CompileEnv, compile, compile_script},
    error::Exception,
    extension::Extension,
    filters::{FilterFn, builtin_filters},
    handlers::{CommandHandler, DataMethodFn, HandlerReg, Output, empty_methods},
    loader::{Loader, TemplateSource},
    parser::RESERVED_TAGS,
    render::{RenderHost, RenderOptions, Template, drive_with_host},
    value::Value,
};

/// Immutable registry snapshot shared by templates and renders.
pub(crate) struct RenderEnv {
    pub filters: AHashMap<String, FilterFn>,
    pub extensions: AHashMap<String, Rc<dyn Extension>>,
    pub handlers: IndexMap<String, HandlerReg>,
    pub data_methods: AHashMap<String, DataMethodFn>,
    pub throw_on_undefined: bool,
    /// For compiling templates loaded mid-render.
    pub compile_env: CompileEnv,
}

/// Configuration and registries for rendering.
pub struct Environment {
    filters: AHashMap<String, FilterFn>,
    async_filters: AHashSet<String>,
    extensions: AHashMap<String, Rc<dyn Extension>>,
    handlers: IndexMap<String, HandlerReg>,
    data_methods: AHashMap<String, DataMethodFn>,
    loader: Option<Box<dyn Loader>>,
    throw_on_undefined: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: builtin_filters(),
            async_filters: AHashSet::new(),
            extensions: AHashMap::new(),
            handlers: IndexMap::new(),
            data_methods: empty_methods(),
            loader: None,
            throw_on_undefined: false,
        }
    }

    /// Reading an unset variable becomes a template error instead of
    /// rendering empty.
    pub fn set_throw_on_undefined(&mut self, throw: bool) -> &mut Self {
        self.throw_on_undefined = throw;
        self
    }

    /// Registers a synchronous filter.
    pub fn add_filter(
        &mut self,
        name: &str,
        func: impl Fn(&Value, &[Value]) -> Result<Value, Exception> + 'static,
    ) -> &mut Self {
        self.filters.insert(name.to_owned(), Rc::new(func));
        self
    }

    /// Declares an asynchronous filter. Uses of it pause the render with a
    /// `FunctionCall` whose path is `["filters", name]`; the host supplies
    /// the result.
    pub fn add_filter_async(&mut self, name: &str) -> &mut Self {
        self.async_filters.insert(name.to_owned());
        self
    }

    /// Registers a custom tag extension.
    pub fn add_extension(&mut self, ext: impl Extension + 'static) -> Result<&mut Self, Exception> {
        let tag = ext.tag().to_owned();
        if RESERVED_TAGS.contains(&tag.as_str()) {
            return Err(Exception::template_error(format!("extension tag `{tag}` shadows a reserved tag")));
        }
        self.extensions.insert(tag, Rc::new(ext));
        Ok(self)
    }

    /// Registers a shared-object command handler; every render dispatches
    /// into the same instance.
    pub fn add_command_handler(&mut self, name: &str, instance: Rc<RefCell<dyn CommandHandler>>) -> &mut Self {
        self.handlers.insert(name.to_owned(), HandlerReg::Object(instance));
        self
    }

    /// Registers a per-render command handler: the factory runs once per
    /// render and the instance's `return_value` lands in the output under
    /// `name`.
    pub fn add_command_handler_class(
        &mut self,
        name: &str,
        factory: impl Fn() -> Box<dyn CommandHandler> + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.to_owned(), HandlerReg::Factory(Rc::new(factory)));
        self
    }

    /// Registers a callable command handler (`@name(args)`).
    pub fn add_command_handler_fn(
        &mut self,
        name: &str,
        func: impl Fn(&[Value]) -> Result<Value, Exception> + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.to_owned(), HandlerReg::Callable(Rc::new(func)));
        self
    }

    /// Extends the data assembler's method vocabulary.
    pub fn add_data_method(
        &mut self,
        name: &str,
        func: impl Fn(Value, &[Value]) -> Result<Value, Exception> + 'static,
    ) -> &mut Self {
        self.data_methods.insert(name.to_owned(), Rc::new(func));
        self
    }

    pub fn set_loader(&mut self, loader: impl Loader + 'static) -> &mut Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub(crate) fn loader(&self) -> Option<&dyn Loader> {
        self.loader.as_deref()
    }

    fn compile_env(&self) -> CompileEnv {
        CompileEnv {
            async_filters: self.async_filters.clone(),
            custom_tags: self.extensions.iter().map(|(tag, ext)| (tag.clone(), ext.has_body())).collect(),
        }
    }

    pub(crate) fn snapshot(&self) -> Rc<RenderEnv> {
        Rc::new(RenderEnv {
            filters: self.filters.clone(),
            extensions: self.extensions.clone(),
            handlers: self.handlers.clone(),
            data_methods: self.data_methods.clone(),
            throw_on_undefined: self.throw_on_undefined,
            compile_env: self.compile_env(),
        })
    }

    /// Compiles a template string.
    pub fn compile_template(&self, source: &str, name: Option<&str>) -> Result<Template, Exception> {
        let compiled = compile(source, name, &self.compile_env())?;
        Ok(Template::new(compiled, self.snapshot()))
    }

    /// Transpiles and compiles a script string.
    pub fn compile_script(&self, source: &str, name: Option<&str>) -> Result<Template, Exception> {
        let compiled = compile_script(source, name, &self.compile_env())?;
        Ok(Template::new(compiled, self.snapshot()))
    }

    /// Renders a template string, answering external calls through `host`
    /// and template loads through `host` then the environment's loader.
    pub fn render_template_string(
        &self,
        source: &str,
        ctx: Vec<(String, Value)>,
        host: &mut dyn RenderHost,
    ) -> Result<Output, Exception> {
        let template = self.compile_template(source, None)?;
        drive_with_host(&template, ctx, RenderOptions::default(), host, self.loader())
    }

    /// Renders a script string.
    pub fn render_script_string(
        &self,
        source: &str,
        ctx: Vec<(String, Value)>,
        host: &mut dyn RenderHost,
    ) -> Result<Output, Exception> {
        let template = self.compile_script(source, None)?;
        drive_with_host(&template, ctx, RenderOptions::default(), host, self.loader())
    }

    /// Renders a named template through the environment's loader.
    pub fn render_template(
        &self,
        name: &str,
        ctx: Vec<(String, Value)>,
        host: &mut dyn RenderHost,
    ) -> Result<Output, Exception> {
        let Some(TemplateSource { source, path }) = self.loader().and_then(|l| l.load(name)) else {
            return Err(Exception::template_error(format!("template not found: {name}")));
        };
        let template = self.compile_template(&source, Some(&path))?;
        drive_with_host(&template, ctx, RenderOptions::default(), host, self.loader())
    }
}
