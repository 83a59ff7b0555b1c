//! Tree-sitter parsing for Python sources.

use tree_sitter::{Node, Parser, Tree};

/// A file whose text could not be turned into a clean syntax tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseFailure {
    pub path: String,
    /// 1-based line of the first syntax error, when one was located.
    pub line: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.path, line, self.message),
            None => write!(f, "{}: {}", self.path, self.message),
        }
    }
}

/// Parse `source` with the Python grammar.
///
/// Tree-sitter always produces a tree; any ERROR or MISSING node in it is
/// treated as a failed parse so that partial trees never feed extraction.
pub fn parse_python(path: &str, source: &str) -> Result<Tree, ParseFailure> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| ParseFailure {
            path: path.to_string(),
            line: None,
            message: format!("failed to load Python grammar: {e}"),
        })?;

    let tree = parser
        .parse(source.as_bytes(), None)
        .ok_or_else(|| ParseFailure {
            path: path.to_string(),
            line: None,
            message: "parser produced no tree".to_string(),
        })?;

    let root = tree.root_node();
    if root.has_error() {
        let line = first_error(root).map(|n| n.start_position().row + 1);
        return Err(ParseFailure {
            path: path.to_string(),
            line,
            message: "syntax error".to_string(),
        });
    }
    Ok(tree)
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}
