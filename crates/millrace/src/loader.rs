//! Template loaders.
//!
//! The runtime itself only consumes a load *capability*: `include`,
//! `extends`, and `import` pause the render with a `LoadTemplate` progress
//! step, and whoever drives the render supplies the body. The types here
//! are the standard implementations the convenience entry points wire in.

use ahash::AHashMap;

/// A loaded template body and the path it should be reported under in
/// errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub source: String,
    pub path: String,
}

impl TemplateSource {
    #[must_use]
    pub fn new(source: impl Into<String>, path: impl Into<String>) -> Self {
        Self { source: source.into(), path: path.into() }
    }
}

/// A named-template source. Loaders must be deterministic within a render
/// and are free to cache.
pub trait Loader {
    fn load(&self, name: &str) -> Option<TemplateSource>;
}

/// In-memory loader backed by a name -> source map.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    templates: AHashMap<String, String>,
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.templates.insert(name.into(), source.into());
        self
    }
}

impl Loader for MemoryLoader {
    fn load(&self, name: &str) -> Option<TemplateSource> {
        self.templates.get(name).map(|source| TemplateSource::new(source.clone(), name))
    }
}

/// Tries each loader in order, first hit wins.
#[derive(Default)]
pub struct ChainLoader {
    loaders: Vec<Box<dyn Loader>>,
}

impl ChainLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loader: impl Loader + 'static) -> &mut Self {
        self.loaders.push(Box::new(loader));
        self
    }
}

impl Loader for ChainLoader {
    fn load(&self, name: &str) -> Option<TemplateSource> {
        self.loaders.iter().find_map(|loader| loader.load(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_loader_prefers_earlier_loaders() {
        let mut first = MemoryLoader::new();
        first.add("a.njk", "first");
        let mut second = MemoryLoader::new();
        second.add("a.njk", "second");
        second.add("b.njk", "only");

        let mut chain = ChainLoader::new();
        chain.push(first);
        chain.push(second);

        assert_eq!(chain.load("a.njk").unwrap().source, "first");
        assert_eq!(chain.load("b.njk").unwrap().source, "only");
        assert!(chain.load("c.njk").is_none());
    }
}
