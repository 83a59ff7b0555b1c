//! Symbol, import, and usage extraction from Python syntax trees.
//!
//! One pass over a parsed file yields:
//! - symbols in source order: an optional `<module>` symbol, then types and
//!   callables, with methods and nested types flattened into dotted names;
//! - the raw import statements, wherever they appear;
//! - the names and attribute chains the file uses outside imports.
//!
//! Functions nested inside callables belong to their enclosing callable and
//! are not emitted on their own.

use std::collections::HashMap;

use tree_sitter::Node;

use crate::indexer::filesystem::{compute_content_hash, SourceFile};
use crate::indexer::parser::{parse_python, ParseFailure};
use crate::models::{ComplexityMarkers, Symbol, SymbolKind, Usages, MODULE_SYMBOL};

// ---------------------------------------------------------------------------
// Extracted types
// ---------------------------------------------------------------------------

/// `name as alias` inside a `from` import.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportedName {
    pub name: String,
    pub alias: Option<String>,
}

impl ImportedName {
    /// The local name the import binds.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportForm {
    /// `import a.b` or `import a.b as c`
    Module { alias: Option<String> },
    /// `from m import x, y as z`
    Names(Vec<ImportedName>),
    /// `from m import *`
    Wildcard,
}

/// An import statement as written. `module` keeps leading dots for
/// relative imports (`..pkg`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImport {
    pub module: String,
    pub form: ImportForm,
    pub line: usize,
}

/// Everything extraction learns about one file.
#[derive(Clone, Debug)]
pub struct ExtractedFile {
    pub path: String,
    pub content_hash: String,
    pub symbols: Vec<Symbol>,
    pub imports: Vec<RawImport>,
    pub usages: Usages,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Parse and extract one file.
pub fn extract_file(source: &SourceFile) -> Result<ExtractedFile, ParseFailure> {
    let tree = parse_python(&source.path, &source.text)?;
    let root = tree.root_node();
    let src = source.text.as_bytes();

    let mut imports = Vec::new();
    collect_imports(root, src, &mut imports);

    let mut usages = Usages::default();
    collect_usages(root, src, &mut usages);

    let mut extraction = Extraction {
        path: &source.path,
        src,
        symbols: Vec::new(),
        seen: HashMap::new(),
    };
    if let Some(module) = extraction.module_symbol(root) {
        extraction.symbols.push(module);
    }
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        extraction.visit_definition(child, &[]);
    }

    Ok(ExtractedFile {
        path: source.path.clone(),
        content_hash: compute_content_hash(&source.text),
        symbols: extraction.symbols,
        imports,
        usages,
    })
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

struct Extraction<'a> {
    path: &'a str,
    src: &'a [u8],
    symbols: Vec<Symbol>,
    /// Occurrences of each qualified name so far.
    seen: HashMap<String, usize>,
}

impl<'a> Extraction<'a> {
    /// Module-level docstring plus every top-level statement that is not a
    /// definition or an import. `None` when there is neither.
    fn module_symbol(&self, root: Node<'_>) -> Option<Symbol> {
        let docstring_node = docstring_statement(root);
        let mut parts: Vec<Node<'_>> = Vec::new();
        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            if Some(child.id()) == docstring_node.map(|n| n.id()) {
                parts.push(child);
                continue;
            }
            match child.kind() {
                "comment"
                | "import_statement"
                | "import_from_statement"
                | "future_import_statement"
                | "function_definition"
                | "class_definition"
                | "decorated_definition" => {}
                _ => parts.push(child),
            }
        }
        let (first, last) = (parts.first()?, parts.last()?);

        let mut markers = ComplexityMarkers::default();
        let mut usages = Usages::default();
        let mut line_count = 0;
        let mut texts = Vec::with_capacity(parts.len());
        for part in &parts {
            scan_markers(*part, self.src, &mut markers);
            collect_usages(*part, self.src, &mut usages);
            line_count += part.end_position().row - part.start_position().row + 1;
            texts.push(node_text(*part, self.src));
        }

        Some(Symbol {
            file_path: self.path.to_string(),
            qualified_name: MODULE_SYMBOL.to_string(),
            name: MODULE_SYMBOL.to_string(),
            kind: SymbolKind::Module,
            start_line: first.start_position().row + 1,
            end_line: last.end_position().row + 1,
            args: None,
            docstring: docstring_node
                .and_then(|n| n.named_child(0))
                .and_then(|s| clean_docstring(node_text(s, self.src))),
            line_count,
            markers,
            source: texts.join("\n"),
            usages,
        })
    }

    fn visit_definition(&mut self, node: Node<'_>, scope: &[String]) {
        let definition = if node.kind() == "decorated_definition" {
            match node.child_by_field_name("definition") {
                Some(d) => d,
                None => return,
            }
        } else {
            node
        };

        let kind = match definition.kind() {
            "function_definition" => SymbolKind::Callable,
            "class_definition" => SymbolKind::Type,
            _ => return,
        };
        let name = match definition.child_by_field_name("name") {
            Some(n) => node_text(n, self.src).to_string(),
            None => return,
        };
        // Redefinitions (property setters, conditional defs) get a `#n`
        // suffix so every symbol keeps its own identity.
        let (qualified_name, segment) = {
            let base = qualify(scope, &name);
            let count = self.seen.entry(base.clone()).or_insert(0);
            *count += 1;
            match *count {
                1 => (base, name.clone()),
                n => (format!("{base}#{n}"), format!("{name}#{n}")),
            }
        };

        let args = match kind {
            SymbolKind::Callable => definition
                .child_by_field_name("parameters")
                .map(|p| collapse_whitespace(node_text(p, self.src))),
            _ => definition
                .child_by_field_name("superclasses")
                .map(|p| collapse_whitespace(node_text(p, self.src))),
        };

        // Decorators are part of the symbol's behaviour, so the outer node
        // defines the slice.
        let mut markers = ComplexityMarkers::default();
        scan_markers(node, self.src, &mut markers);
        let mut usages = Usages::default();
        collect_usages(node, self.src, &mut usages);

        let start_line = node.start_position().row + 1;
        let end_line = node.end_position().row + 1;
        self.symbols.push(Symbol {
            file_path: self.path.to_string(),
            qualified_name: qualified_name.clone(),
            name: name.clone(),
            kind,
            start_line,
            end_line,
            args,
            docstring: definition
                .child_by_field_name("body")
                .and_then(docstring_statement)
                .and_then(|n| n.named_child(0))
                .and_then(|s| clean_docstring(node_text(s, self.src))),
            line_count: end_line - start_line + 1,
            markers,
            source: node_text(node, self.src).to_string(),
            usages,
        });

        if kind == SymbolKind::Type {
            if let Some(body) = definition.child_by_field_name("body") {
                let mut inner_scope = scope.to_vec();
                inner_scope.push(segment);
                let mut cursor = body.walk();
                for child in body.named_children(&mut cursor) {
                    self.visit_definition(child, &inner_scope);
                }
            }
        }
    }
}

fn qualify(scope: &[String], name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", scope.join("."), name)
    }
}

/// The first statement of a block, when it is a bare string literal.
fn docstring_statement(block: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = block.walk();
    let first = block
        .named_children(&mut cursor)
        .find(|c| c.kind() != "comment")?;
    if first.kind() != "expression_statement" || first.named_child_count() != 1 {
        return None;
    }
    match first.named_child(0)?.kind() {
        "string" => Some(first),
        _ => None,
    }
}

/// Strip prefixes and quotes from a string literal and trim every line.
pub(crate) fn clean_docstring(raw: &str) -> Option<String> {
    let body = raw.trim_start_matches(|c: char| matches!(c, 'r' | 'R' | 'u' | 'U'));
    let body = ["\"\"\"", "'''", "\"", "'"]
        .iter()
        .find_map(|quote| {
            if body.len() >= quote.len() * 2 && body.starts_with(quote) && body.ends_with(quote) {
                Some(&body[quote.len()..body.len() - quote.len()])
            } else {
                None
            }
        })
        .unwrap_or(body);

    let lines: Vec<&str> = body.lines().map(str::trim).collect();
    let start = lines.iter().position(|l| !l.is_empty())?;
    let end = lines.iter().rposition(|l| !l.is_empty())?;
    Some(lines[start..=end].join("\n"))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("( ", "(")
        .replace(" )", ")")
}

fn node_text<'s>(node: Node<'_>, src: &'s [u8]) -> &'s str {
    node.utf8_text(src).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Complexity markers
// ---------------------------------------------------------------------------

const REFLECTIVE_CALLS: &[&str] = &["getattr", "setattr", "hasattr", "delattr"];
const DYNAMIC_EVAL_CALLS: &[&str] = &["eval", "exec", "compile"];
const CATCH_ALL_TYPES: &[&str] = &["Exception", "BaseException"];

fn scan_markers(node: Node<'_>, src: &[u8], markers: &mut ComplexityMarkers) {
    match node.kind() {
        "yield" | "await" | "lambda" => markers.deferred = true,
        "exec_statement" => markers.dynamic_eval = true,
        "function_definition" => {
            let mut cursor = node.walk();
            if node.children(&mut cursor).any(|c| c.kind() == "async") {
                markers.deferred = true;
            }
        }
        "call" => {
            if let Some(function) = node.child_by_field_name("function") {
                let name = node_text(function, src);
                if REFLECTIVE_CALLS.contains(&name) {
                    markers.reflective = true;
                } else if DYNAMIC_EVAL_CALLS.contains(&name) {
                    markers.dynamic_eval = true;
                }
            }
        }
        "attribute" => {
            if let Some(object) = node.child_by_field_name("object") {
                if object.kind() == "identifier" && node_text(object, src) == "ast" {
                    markers.dynamic_eval = true;
                }
            }
        }
        "identifier" => {
            if node_text(node, src) == "__metaclass__" {
                markers.reflective = true;
            }
        }
        "keyword_argument" => {
            if let Some(name) = node.child_by_field_name("name") {
                if node_text(name, src) == "metaclass" {
                    markers.reflective = true;
                }
            }
        }
        "except_clause" => {
            if catches_everything(node, src) {
                markers.catch_all = true;
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        scan_markers(child, src, markers);
    }
}

fn catches_everything(clause: Node<'_>, src: &[u8]) -> bool {
    let mut cursor = clause.walk();
    let caught = clause
        .named_children(&mut cursor)
        .find(|c| c.kind() != "block" && c.kind() != "comment");
    let caught = match caught {
        None => return true,
        Some(c) if c.kind() == "as_pattern" => match c.named_child(0) {
            Some(inner) => inner,
            None => return false,
        },
        Some(c) => c,
    };
    caught.kind() == "identifier" && CATCH_ALL_TYPES.contains(&node_text(caught, src))
}

// ---------------------------------------------------------------------------
// Usages
// ---------------------------------------------------------------------------

/// Record identifiers and maximal attribute chains under `node`, skipping
/// import statements and the names introduced by definitions.
fn collect_usages(node: Node<'_>, src: &[u8], usages: &mut Usages) {
    match node.kind() {
        "import_statement" | "import_from_statement" | "future_import_statement" => return,
        "identifier" => {
            usages.insert(node_text(node, src));
            return;
        }
        "attribute" => {
            match dotted_chain(node, src) {
                Some(chain) => usages.insert(chain),
                None => {
                    if let Some(object) = node.child_by_field_name("object") {
                        collect_usages(object, src, usages);
                    }
                }
            }
            return;
        }
        "function_definition" | "class_definition" | "keyword_argument" => {
            let skipped = node.child_by_field_name("name").map(|n| n.id());
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if Some(child.id()) != skipped {
                    collect_usages(child, src, usages);
                }
            }
            return;
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_usages(child, src, usages);
    }
}

/// `a.b.c` for an attribute node built only from identifiers.
fn dotted_chain(node: Node<'_>, src: &[u8]) -> Option<String> {
    match node.kind() {
        "identifier" => Some(node_text(node, src).to_string()),
        "attribute" => {
            let object = dotted_chain(node.child_by_field_name("object")?, src)?;
            let attribute = node.child_by_field_name("attribute")?;
            Some(format!("{object}.{}", node_text(attribute, src)))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

fn collect_imports(node: Node<'_>, src: &[u8], out: &mut Vec<RawImport>) {
    match node.kind() {
        "import_statement" => {
            let line = node.start_position().row + 1;
            let mut cursor = node.walk();
            for name in node.children_by_field_name("name", &mut cursor) {
                if let Some(imported) = imported_name(name, src) {
                    out.push(RawImport {
                        module: imported.name,
                        form: ImportForm::Module {
                            alias: imported.alias,
                        },
                        line,
                    });
                }
            }
        }
        "import_from_statement" => {
            let line = node.start_position().row + 1;
            let module: String = match node.child_by_field_name("module_name") {
                Some(m) => node_text(m, src).split_whitespace().collect(),
                None => return,
            };
            let mut cursor = node.walk();
            let wildcard = node
                .named_children(&mut cursor)
                .any(|c| c.kind() == "wildcard_import");
            let form = if wildcard {
                ImportForm::Wildcard
            } else {
                let mut cursor = node.walk();
                let names: Vec<ImportedName> = node
                    .children_by_field_name("name", &mut cursor)
                    .filter_map(|n| imported_name(n, src))
                    .collect();
                ImportForm::Names(names)
            };
            out.push(RawImport { module, form, line });
        }
        _ => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_imports(child, src, out);
            }
        }
    }
}

fn imported_name(node: Node<'_>, src: &[u8]) -> Option<ImportedName> {
    match node.kind() {
        "dotted_name" => Some(ImportedName {
            name: node_text(node, src).split_whitespace().collect(),
            alias: None,
        }),
        "aliased_import" => Some(ImportedName {
            name: node_text(node.child_by_field_name("name")?, src)
                .split_whitespace()
                .collect(),
            alias: node
                .child_by_field_name("alias")
                .map(|a| node_text(a, src).to_string()),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> ExtractedFile {
        extract_file(&SourceFile::new("pkg/sample.py", text)).unwrap()
    }

    fn names(file: &ExtractedFile) -> Vec<&str> {
        file.symbols
            .iter()
            .map(|s| s.qualified_name.as_str())
            .collect()
    }

    #[test]
    fn flattens_methods_and_nested_types() {
        let file = extract(
            "class Outer(Base):\n    def method(self, x):\n        return x\n\n    class Inner:\n        def deep(self):\n            pass\n\ndef top(a, b=1):\n    def helper():\n        pass\n    return a\n",
        );
        assert_eq!(
            names(&file),
            vec!["Outer", "Outer.method", "Outer.Inner", "Outer.Inner.deep", "top"]
        );
        let outer = &file.symbols[0];
        assert_eq!(outer.kind, SymbolKind::Type);
        assert_eq!(outer.args.as_deref(), Some("(Base)"));
        let top = &file.symbols[4];
        assert_eq!(top.signature(), "top(a, b=1)");
        assert_eq!((top.start_line, top.end_line), (9, 12));
        assert_eq!(top.line_count, 4);
    }

    #[test]
    fn redefined_names_get_distinct_identities() {
        let file = extract(
            "class C:\n    @property\n    def x(self):\n        return self._x\n\n    @x.setter\n    def x(self, value):\n        self._x = value\n\nclass C:\n    def m(self):\n        pass\n",
        );
        assert_eq!(names(&file), vec!["C", "C.x", "C.x#2", "C#2", "C#2.m"]);
        assert_eq!(file.symbols[2].name, "x");
        assert_eq!(file.symbols[2].signature(), "C.x#2(self, value)");
    }

    #[test]
    fn decorated_definitions_include_decorators() {
        let file = extract("@cache\ndef f():\n    return 1\n");
        assert_eq!(names(&file), vec!["f"]);
        assert_eq!(file.symbols[0].start_line, 1);
        assert!(file.symbols[0].source.starts_with("@cache"));
        assert!(file.symbols[0].usages.bare("cache"));
    }

    #[test]
    fn extracts_docstrings() {
        let file = extract(
            "\"\"\"Module doc.\"\"\"\n\ndef f():\n    \"\"\"\n    First line.\n    Second line.\n    \"\"\"\n    return 1\n",
        );
        assert_eq!(names(&file), vec![MODULE_SYMBOL, "f"]);
        assert_eq!(file.symbols[0].docstring.as_deref(), Some("Module doc."));
        assert_eq!(
            file.symbols[1].docstring.as_deref(),
            Some("First line.\nSecond line.")
        );
    }

    #[test]
    fn module_symbol_only_with_top_level_code() {
        let defs_only = extract("import os\n\ndef f():\n    pass\n");
        assert_eq!(names(&defs_only), vec!["f"]);

        let scripted = extract("import os\n\nCONFIG = os.environ\n\ndef f():\n    pass\n");
        assert_eq!(names(&scripted), vec![MODULE_SYMBOL, "f"]);
        let module = &scripted.symbols[0];
        assert_eq!(module.source, "CONFIG = os.environ");
        assert!(module.usages.mentions("os"));
    }

    #[test]
    fn detects_complexity_markers() {
        let file = extract(
            "def gen():\n    yield 1\n\ndef reflect(o):\n    return getattr(o, 'x')\n\ndef run(code):\n    exec(code)\n\ndef guard():\n    try:\n        pass\n    except Exception as e:\n        pass\n\ndef plain(x):\n    return x\n",
        );
        let markers: Vec<ComplexityMarkers> = file.symbols.iter().map(|s| s.markers).collect();
        assert!(markers[0].deferred);
        assert!(markers[1].reflective);
        assert!(markers[2].dynamic_eval);
        assert!(markers[3].catch_all);
        assert!(markers[4].is_empty());
    }

    #[test]
    fn bare_except_is_catch_all() {
        let file = extract("def f():\n    try:\n        pass\n    except:\n        pass\n");
        assert!(file.symbols[0].markers.catch_all);
        let narrow = extract("def f():\n    try:\n        pass\n    except ValueError:\n        pass\n");
        assert!(!narrow.symbols[0].markers.catch_all);
    }

    #[test]
    fn async_functions_are_deferred() {
        let file = extract("async def fetch():\n    return 1\n");
        assert!(file.symbols[0].markers.deferred);
    }

    #[test]
    fn collects_imports_in_all_forms() {
        let file = extract(
            "import os\nimport a.b as ab\nfrom . import sibling\nfrom ..pkg.mod import x, y as z\nfrom m import *\n\ndef f():\n    import json\n",
        );
        assert_eq!(file.imports.len(), 6);
        assert_eq!(file.imports[0].module, "os");
        assert_eq!(
            file.imports[1].form,
            ImportForm::Module {
                alias: Some("ab".into())
            }
        );
        assert_eq!(file.imports[2].module, ".");
        assert_eq!(file.imports[3].module, "..pkg.mod");
        match &file.imports[3].form {
            ImportForm::Names(names) => {
                assert_eq!(names[0].binding(), "x");
                assert_eq!(names[1].binding(), "z");
            }
            other => panic!("unexpected form {other:?}"),
        }
        assert_eq!(file.imports[4].form, ImportForm::Wildcard);
        assert_eq!(file.imports[5].module, "json");
        assert_eq!(file.imports[5].line, 8);
    }

    #[test]
    fn usages_exclude_imports_and_definition_names() {
        let file = extract("from a import x, unused\n\ndef f(v):\n    return x(v) + os.path.join(v)\n");
        assert!(file.usages.mentions("x"));
        assert!(!file.usages.mentions("unused"));
        assert!(file.usages.bare("os.path.join"));
        assert!(!file.usages.bare("f"));
    }

    #[test]
    fn parse_failure_is_reported() {
        let failure = extract_file(&SourceFile::new("bad.py", "def (:\n")).unwrap_err();
        assert_eq!(failure.path, "bad.py");
    }

    #[test]
    fn clean_docstring_strips_quotes_and_prefixes() {
        assert_eq!(clean_docstring("r'''raw'''").as_deref(), Some("raw"));
        assert_eq!(clean_docstring("\"one\"").as_deref(), Some("one"));
        assert_eq!(clean_docstring("\"\"\"   \"\"\""), None);
    }
}
