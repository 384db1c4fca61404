//! Module model and the import-resolving loader.
//!
//! The loader turns one entry source into a [`CompilationBundle`]: the
//! transitive closure of imported modules, each parsed exactly once. A
//! pluggable [`SourceResolver`] maps import keys to absolute keys and
//! content, so hosts decide where sources actually live (memory map,
//! filesystem, archive). Parsed modules are cached per loader, keyed by
//! absolute key, which both guarantees termination on import cycles and
//! makes re-imports free.

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::{
    ast::{AstKind, AstNode, ImportDecl},
    error::{ErrorCode, QuillError},
    lexer, parser,
};

/// Which grammar a source is parsed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    /// Top-level statements and declarations.
    #[default]
    Script,
    /// Declarations only.
    Module,
    /// Class member forms.
    ClassBody,
    /// Struct field forms.
    StructBody,
    /// Statements inside a function body.
    FunctionBody,
    /// Exactly one expression.
    Expression,
}

/// The parse result of one module, cached and shared by the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedModule {
    /// Absolute key identifying this module.
    pub key: String,
    pub source_type: SourceType,
    pub nodes: Vec<AstNode>,
    /// Import declarations with resolver-annotated absolute keys.
    pub imports: Vec<ImportDecl>,
    /// Name from a `library` declaration, if present.
    pub library_name: Option<String>,
    pub errors: Vec<QuillError>,
}

impl ParsedModule {
    /// Parses a source under the given type and collects its imports and
    /// library declaration. Import keys are not yet resolved.
    #[must_use]
    pub fn parse(key: impl Into<String>, content: &str, source_type: SourceType) -> Self {
        let key = key.into();
        let (tokens, mut errors) = lexer::lex(content);
        let (nodes, parse_errors) = parser::parse(&tokens, source_type);
        errors.extend(parse_errors);
        for error in &mut errors {
            if error.module.is_none() {
                error.module = Some(key.clone());
            }
        }
        let mut imports = Vec::new();
        let mut library_name = None;
        for node in &nodes {
            match &node.kind {
                AstKind::ImportDecl(decl) => imports.push(decl.clone()),
                AstKind::LibraryDecl { name } => library_name = Some(name.clone()),
                _ => {}
            }
        }
        Self {
            key,
            source_type,
            nodes,
            imports,
            library_name,
            errors,
        }
    }

    /// Whether any accumulated error is an actual error (not advisory).
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A resolved import: the absolute key plus the module content.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub key: String,
    pub content: String,
}

/// Maps import keys to absolute keys and source content.
///
/// `current_dir` is the directory part of the importing module's key, so
/// relative keys resolve relative to their importer.
pub trait SourceResolver {
    fn resolve(&self, key: &str, current_dir: &str) -> Result<ResolvedSource, String>;
}

impl<R: SourceResolver + ?Sized> SourceResolver for Box<R> {
    fn resolve(&self, key: &str, current_dir: &str) -> Result<ResolvedSource, String> {
        (**self).resolve(key, current_dir)
    }
}

/// A resolver over an in-memory map of sources. Useful for embedding and
/// for tests; the CLI shell layers a filesystem resolver on the same
/// trait.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    sources: AHashMap<String, String>,
}

impl MemoryResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module source under its absolute key.
    pub fn add(&mut self, key: impl Into<String>, content: impl Into<String>) -> &mut Self {
        self.sources.insert(key.into(), content.into());
        self
    }
}

/// Joins and normalizes a possibly relative key against a directory,
/// folding `.` and `..` segments.
#[must_use]
pub fn normalize_key(key: &str, current_dir: &str) -> String {
    let joined = if key.starts_with('/') || current_dir.is_empty() {
        key.to_owned()
    } else {
        format!("{current_dir}/{key}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut normalized = parts.join("/");
    if joined.starts_with('/') {
        normalized.insert(0, '/');
    }
    normalized
}

impl SourceResolver for MemoryResolver {
    fn resolve(&self, key: &str, current_dir: &str) -> Result<ResolvedSource, String> {
        let normalized = normalize_key(key, current_dir);
        // exact keys win over importer-relative ones
        let (key, content) = if let Some(content) = self.sources.get(key) {
            (key.to_owned(), content)
        } else if let Some(content) = self.sources.get(&normalized) {
            (normalized, content)
        } else {
            return Err(format!("module `{key}` not found"));
        };
        Ok(ResolvedSource {
            key,
            content: content.clone(),
        })
    }
}

/// The transitive closure of modules for one compilation.
///
/// Modules appear in dependency order: every import of a module precedes
/// it, so executing the bundle front to back satisfies imports. The entry
/// module is last.
#[derive(Debug, Default)]
pub struct CompilationBundle {
    pub modules: IndexMap<String, Rc<ParsedModule>>,
    pub entry_key: String,
    /// Name of the library this bundle forms, when one was declared or
    /// supplied by the host.
    pub library_name: Option<String>,
}

impl CompilationBundle {
    /// All errors across the bundle, entry first.
    #[must_use]
    pub fn errors(&self) -> Vec<QuillError> {
        let mut all = Vec::new();
        if let Some(entry) = self.modules.get(&self.entry_key) {
            all.extend(entry.errors.iter().cloned());
        }
        for (key, module) in &self.modules {
            if *key != self.entry_key {
                all.extend(module.errors.iter().cloned());
            }
        }
        all
    }
}

/// Parses an entry source and the transitive closure of its imports.
///
/// Owns the per-loader parse cache: a module reached twice (diamond
/// imports, repeated compilations through the same loader) is parsed once
/// and the same [`Rc`] is handed out again.
pub struct ModuleLoader<R: SourceResolver> {
    resolver: R,
    cache: AHashMap<String, Rc<ParsedModule>>,
}

impl<R: SourceResolver> ModuleLoader<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            cache: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut R {
        &mut self.resolver
    }

    /// Parses `entry_source` and recursively every module it imports,
    /// producing the compilation bundle.
    ///
    /// Resolver failures are recorded as `SourceProviderError` on the
    /// importing module; loading continues with the remaining imports.
    pub fn parse_to_compilation(
        &mut self,
        entry_source: &str,
        entry_key: &str,
        library_name: Option<&str>,
    ) -> CompilationBundle {
        let mut bundle = CompilationBundle {
            entry_key: entry_key.to_owned(),
            ..CompilationBundle::default()
        };
        let entry = self.parse_and_cache(entry_key, entry_source, SourceType::Script);
        let mut in_progress = AHashSet::new();
        in_progress.insert(entry_key.to_owned());
        for import_key in Self::resolved_imports(&entry) {
            self.load(&import_key, &mut bundle, &mut in_progress);
        }
        bundle.library_name = library_name
            .map(str::to_owned)
            .or_else(|| entry.library_name.clone());
        bundle.modules.insert(entry_key.to_owned(), entry);
        bundle
    }

    /// Parses one module source, resolves and annotates its imports, and
    /// caches it under its absolute key.
    fn parse_and_cache(&mut self, key: &str, content: &str, source_type: SourceType) -> Rc<ParsedModule> {
        if let Some(cached) = self.cache.get(key) {
            return Rc::clone(cached);
        }
        let mut module = ParsedModule::parse(key, content, source_type);
        let current_dir = directory_of(key);
        for index in 0..module.imports.len() {
            let import_key = module.imports[index].key.clone();
            match self.resolver.resolve(&import_key, &current_dir) {
                Ok(resolved) => {
                    module.imports[index].resolved_key = Some(resolved.key.clone());
                    annotate_import(&mut module.nodes, &import_key, &resolved.key);
                }
                Err(reason) => {
                    module.errors.push(
                        QuillError::positionless(
                            ErrorCode::SourceProviderError,
                            format!("cannot resolve import `{import_key}`: {reason}"),
                        )
                        .in_module(key),
                    );
                }
            }
        }
        let module = Rc::new(module);
        self.cache.insert(key.to_owned(), Rc::clone(&module));
        module
    }

    /// Loads `key` and its imports depth-first, inserting each module into
    /// the bundle after its imports (dependency order). The in-progress
    /// set breaks import cycles.
    fn load(&mut self, key: &str, bundle: &mut CompilationBundle, in_progress: &mut AHashSet<String>) {
        if bundle.modules.contains_key(key) || in_progress.contains(key) {
            return;
        }
        let module = if let Some(cached) = self.cache.get(key) {
            Rc::clone(cached)
        } else {
            let current_dir = directory_of(key);
            match self.resolver.resolve(key, &current_dir) {
                Ok(resolved) => self.parse_and_cache(&resolved.key, &resolved.content, SourceType::Module),
                Err(reason) => {
                    // the importing module already carries the resolver
                    // error; nothing further to load here
                    let _ = reason;
                    return;
                }
            }
        };
        in_progress.insert(key.to_owned());
        for import_key in Self::resolved_imports(&module) {
            self.load(&import_key, bundle, in_progress);
        }
        in_progress.remove(key);
        bundle.modules.insert(key.to_owned(), module);
    }

    fn resolved_imports(module: &ParsedModule) -> Vec<String> {
        module
            .imports
            .iter()
            .filter_map(|import| import.resolved_key.clone())
            .collect()
    }
}

/// The directory part of a module key, empty when the key has none.
#[must_use]
pub fn directory_of(key: &str) -> String {
    match key.rfind('/') {
        Some(pos) => key[..pos].to_owned(),
        None => String::new(),
    }
}

/// Rewrites the matching AST import declaration with its absolute key.
fn annotate_import(nodes: &mut [AstNode], raw_key: &str, resolved: &str) {
    for node in nodes {
        if let AstKind::ImportDecl(decl) = &mut node.kind
            && decl.key == raw_key
            && decl.resolved_key.is_none()
        {
            decl.resolved_key = Some(resolved.to_owned());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn loader_with(sources: &[(&str, &str)]) -> ModuleLoader<MemoryResolver> {
        let mut resolver = MemoryResolver::new();
        for (key, content) in sources {
            resolver.add(*key, *content);
        }
        ModuleLoader::new(resolver)
    }

    #[test]
    fn bundle_contains_transitive_imports_in_dependency_order() {
        let mut loader = loader_with(&[
            ("a.ql", "import 'b.ql'\nvar a = 1"),
            ("b.ql", "import 'c.ql'\nvar b = 2"),
            ("c.ql", "var c = 3"),
        ]);
        let bundle = loader.parse_to_compilation("import 'a.ql'\nvar main = 0", "main.ql", None);
        let keys: Vec<&String> = bundle.modules.keys().collect();
        assert_eq!(keys, ["c.ql", "b.ql", "a.ql", "main.ql"]);
    }

    #[test]
    fn repeated_parse_returns_identical_module() {
        let mut loader = loader_with(&[("shared.ql", "var s = 1")]);
        let first = loader.parse_to_compilation("import 'shared.ql'", "one.ql", None);
        let second = loader.parse_to_compilation("import 'shared.ql'", "two.ql", None);
        let a = first.modules.get("shared.ql").expect("first bundle has shared");
        let b = second.modules.get("shared.ql").expect("second bundle has shared");
        assert!(Rc::ptr_eq(a, b), "cache must hand out the identical parse result");
    }

    #[test]
    fn diamond_imports_parse_once() {
        let mut loader = loader_with(&[
            ("left.ql", "import 'base.ql'"),
            ("right.ql", "import 'base.ql'"),
            ("base.ql", "var base = 1"),
        ]);
        let bundle = loader.parse_to_compilation("import 'left.ql'\nimport 'right.ql'", "top.ql", None);
        assert_eq!(bundle.modules.keys().filter(|k| *k == "base.ql").count(), 1);
    }

    #[test]
    fn import_cycles_terminate() {
        let mut loader = loader_with(&[("x.ql", "import 'y.ql'"), ("y.ql", "import 'x.ql'")]);
        let bundle = loader.parse_to_compilation("import 'x.ql'", "main.ql", None);
        assert!(bundle.modules.contains_key("x.ql"));
        assert!(bundle.modules.contains_key("y.ql"));
    }

    #[test]
    fn resolver_failure_is_recorded_and_loading_continues() {
        let mut loader = loader_with(&[("real.ql", "var ok = 1")]);
        let bundle = loader.parse_to_compilation("import 'missing.ql'\nimport 'real.ql'", "main.ql", None);
        let entry = bundle.modules.get("main.ql").expect("entry present");
        assert!(entry.errors.iter().any(|e| e.code == ErrorCode::SourceProviderError));
        assert!(bundle.modules.contains_key("real.ql"));
    }

    #[test]
    fn import_nodes_are_annotated_with_absolute_keys() {
        let mut loader = loader_with(&[("lib/util.ql", "var u = 1")]);
        let bundle = loader.parse_to_compilation("import 'lib/util.ql'", "main.ql", None);
        let entry = bundle.modules.get("main.ql").expect("entry present");
        assert_eq!(entry.imports[0].resolved_key.as_deref(), Some("lib/util.ql"));
        let annotated = entry.nodes.iter().any(|n| {
            matches!(&n.kind, AstKind::ImportDecl(d) if d.resolved_key.as_deref() == Some("lib/util.ql"))
        });
        assert!(annotated);
    }

    #[test]
    fn relative_keys_resolve_against_importer_directory() {
        assert_eq!(normalize_key("./sibling.ql", "pkg/sub"), "pkg/sub/sibling.ql");
        assert_eq!(normalize_key("../up.ql", "pkg/sub"), "pkg/up.ql");
        assert_eq!(normalize_key("/abs.ql", "pkg"), "/abs.ql");
    }

    #[test]
    fn library_declaration_names_the_bundle() {
        let mut loader = loader_with(&[]);
        let bundle = loader.parse_to_compilation("library 'core'\nvar x = 1", "core.ql", None);
        assert_eq!(bundle.library_name.as_deref(), Some("core"));
    }
}
