//! Import resolution from raw import statements to symbol-level references.
//!
//! Each reference names one symbol of one source module as seen from one
//! consuming file, and carries whether the consumer actually uses it. Only
//! used references to files inside the indexed set feed the dependency graph.

use std::collections::BTreeSet;
use std::path::Path;

use indexmap::IndexMap;

use crate::indexer::symbols::{ExtractedFile, ImportForm, RawImport};
use crate::models::{
    Reference, ReferenceTarget, UsageKey, Usages, MODULE_SYMBOL, WILDCARD_SYMBOL,
};

/// Map a Python module name to a file in `all_files`.
///
/// Relative names (`.`, `..pkg.mod`) resolve against the consumer's package.
/// Absolute names resolve from the root first, then from the consumer's own
/// directory, which is how scripts importing their siblings behave.
pub fn resolve_python(
    source_path: &str,
    module_name: &str,
    all_files: &BTreeSet<String>,
) -> Option<String> {
    if module_name.is_empty() {
        return None;
    }
    let source_dir = Path::new(source_path).parent().unwrap_or(Path::new(""));

    if module_name.starts_with('.') {
        let levels = module_name.chars().take_while(|&c| c == '.').count();
        let suffix = &module_name[levels..];
        let mut base_dir = source_dir.to_path_buf();
        for _ in 0..levels.saturating_sub(1) {
            base_dir = base_dir.parent()?.to_path_buf();
        }
        let base = if suffix.is_empty() {
            base_dir.to_string_lossy().replace('\\', "/")
        } else {
            base_dir
                .join(suffix.replace('.', "/"))
                .to_string_lossy()
                .replace('\\', "/")
        };
        return find_module_file(&base, all_files);
    }

    let base = module_name.replace('.', "/");
    find_module_file(&base, all_files).or_else(|| {
        let sibling = source_dir.join(&base).to_string_lossy().replace('\\', "/");
        if sibling == base {
            None
        } else {
            find_module_file(&sibling, all_files)
        }
    })
}

fn find_module_file(base: &str, all_files: &BTreeSet<String>) -> Option<String> {
    let base = normalize_posix_path(base);
    let candidates = if base.is_empty() {
        vec!["__init__.py".to_string()]
    } else {
        vec![format!("{base}.py"), format!("{base}/__init__.py")]
    };
    candidates.into_iter().find(|c| all_files.contains(c))
}

fn normalize_posix_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            _ => stack.push(part),
        }
    }
    stack.join("/")
}

/// `from m import n` names a submodule when `m.n` is itself a file.
fn submodule_name(module: &str, name: &str) -> String {
    if module.ends_with('.') {
        format!("{module}{name}")
    } else {
        format!("{module}.{name}")
    }
}

// ---------------------------------------------------------------------------
// Reference table
// ---------------------------------------------------------------------------

type ReferenceKey = (String, ReferenceTarget, UsageKey);

struct ReferenceTable<'a> {
    consumer: &'a str,
    usages: &'a Usages,
    entries: IndexMap<ReferenceKey, Reference>,
}

impl<'a> ReferenceTable<'a> {
    fn push(
        &mut self,
        symbol: &str,
        target: ReferenceTarget,
        alias: Option<&str>,
        usage_key: UsageKey,
        line: usize,
    ) {
        let key = (symbol.to_string(), target.clone(), usage_key.clone());
        let (consumer, usages) = (self.consumer, self.usages);
        self.entries.entry(key).or_insert_with(|| {
            let mut reference = Reference {
                consumer: consumer.to_string(),
                symbol: symbol.to_string(),
                target,
                alias: alias.map(str::to_string),
                usage_key,
                used: false,
                line,
            };
            reference.used = reference.used_by(usages);
            reference
        });
    }

    /// One reference per attribute accessed through `binding`, plus a
    /// whole-module reference when the binding is used bare or not at all.
    fn push_module(
        &mut self,
        target: ReferenceTarget,
        binding: &str,
        alias: Option<&str>,
        line: usize,
    ) {
        if target.internal_path().is_none() {
            self.push(
                MODULE_SYMBOL,
                target,
                alias,
                UsageKey::Name(binding.to_string()),
                line,
            );
            return;
        }
        let members = self.usages.members_of(binding);
        for member in &members {
            self.push(
                member,
                target.clone(),
                alias,
                UsageKey::Name(format!("{binding}.{member}")),
                line,
            );
        }
        if members.is_empty() || self.usages.bare(binding) {
            self.push(
                MODULE_SYMBOL,
                target,
                alias,
                UsageKey::Bare(binding.to_string()),
                line,
            );
        }
    }
}

/// Build the reference table for one extracted file.
///
/// `all_files` is the full set of indexed paths; anything that does not
/// resolve into it is recorded as external.
pub fn resolve_references(file: &ExtractedFile, all_files: &BTreeSet<String>) -> Vec<Reference> {
    let mut table = ReferenceTable {
        consumer: &file.path,
        usages: &file.usages,
        entries: IndexMap::new(),
    };

    for import in &file.imports {
        resolve_import(&file.path, import, all_files, &mut table);
    }

    table.entries.into_values().collect()
}

fn resolve_import(
    consumer: &str,
    import: &RawImport,
    all_files: &BTreeSet<String>,
    table: &mut ReferenceTable<'_>,
) {
    let resolved = resolve_python(consumer, &import.module, all_files);
    let target = match &resolved {
        Some(path) => ReferenceTarget::Internal(path.clone()),
        None => ReferenceTarget::External(import.module.clone()),
    };

    match &import.form {
        ImportForm::Module { alias } => {
            let binding = alias.as_deref().unwrap_or(&import.module);
            table.push_module(target, binding, alias.as_deref(), import.line);
        }
        ImportForm::Wildcard => {
            table.push(WILDCARD_SYMBOL, target, None, UsageKey::Always, import.line);
        }
        ImportForm::Names(names) => {
            for imported in names {
                let binding = imported.binding();
                let submodule = resolve_python(
                    consumer,
                    &submodule_name(&import.module, &imported.name),
                    all_files,
                );
                match submodule {
                    Some(path) => table.push_module(
                        ReferenceTarget::Internal(path),
                        binding,
                        imported.alias.as_deref(),
                        import.line,
                    ),
                    None => table.push(
                        &imported.name,
                        target.clone(),
                        imported.alias.as_deref(),
                        UsageKey::Name(binding.to_string()),
                        import.line,
                    ),
                }
            }
        }
    }
}
