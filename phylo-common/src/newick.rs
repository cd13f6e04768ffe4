use std::io::Write;

use crate::namespace::TaxonNamespace;
use crate::tree::{NodeId, Tree};
use crate::TreeError;

/// Parse a single rooted newick tree.
///
/// Tip labels are registered in (or resolved against) `ns`; internal labels
/// are kept as plain strings. Underscores in unquoted labels read as
/// spaces, quoted labels are taken verbatim, and `[...]` comments are
/// skipped. Edge lengths are optional and default to 0.
pub fn parse_newick(input: &str, ns: &mut TaxonNamespace) -> Result<Tree, TreeError> {
    Parser {
        bytes: input.as_bytes(),
        pos: 0,
    }
    .parse(ns)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> TreeError {
        TreeError::Parse {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_trivia(&mut self) -> Result<(), TreeError> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(b'[') => {
                    while self.peek() != Some(b']') {
                        if self.peek().is_none() {
                            return Err(self.error("unterminated comment"));
                        }
                        self.pos += 1;
                    }
                    self.pos += 1;
                }
                _ => return Ok(()),
            }
        }
    }

    /// A quoted or unquoted label, or `None` if the next byte starts
    /// something else.
    fn parse_label(&mut self) -> Result<Option<String>, TreeError> {
        self.skip_trivia()?;
        match self.peek() {
            Some(b'\'') => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.peek() {
                        Some(b'\'') if self.bytes.get(self.pos + 1) == Some(&b'\'') => {
                            out.push('\'');
                            self.pos += 2;
                        }
                        Some(b'\'') => {
                            self.pos += 1;
                            return Ok(Some(out));
                        }
                        Some(c) => {
                            out.push(c as char);
                            self.pos += 1;
                        }
                        None => return Err(self.error("unterminated quoted label")),
                    }
                }
            }
            Some(c) if !b"(),:;[".contains(&c) && !c.is_ascii_whitespace() => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if b"(),:;[".contains(&c) || c.is_ascii_whitespace() {
                        break;
                    }
                    self.pos += 1;
                }
                let raw = std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|_| self.error("label is not valid utf-8"))?;
                Ok(Some(raw.replace('_', " ")))
            }
            _ => Ok(None),
        }
    }

    /// `:length` if present.
    fn parse_length(&mut self) -> Result<Option<f64>, TreeError> {
        self.skip_trivia()?;
        if self.peek() != Some(b':') {
            return Ok(None);
        }
        self.pos += 1;
        self.skip_trivia()?;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || b"+-.eE".contains(&c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        let raw = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("branch length is not valid utf-8"))?;
        raw.parse::<f64>()
            .map(Some)
            .map_err(|_| self.error("malformed branch length"))
    }

    fn parse(mut self, ns: &mut TaxonNamespace) -> Result<Tree, TreeError> {
        let mut tree = Tree {
            nodes: vec![],
            root: NodeId(0),
        };
        let mut stack: Vec<NodeId> = vec![];
        let root = loop {
            self.skip_trivia()?;
            match self.peek() {
                Some(b'(') => {
                    self.pos += 1;
                    let id = tree.new_node();
                    if let Some(top) = stack.last() {
                        tree.attach(*top, id);
                    }
                    stack.push(id);
                }
                Some(b')') => {
                    self.pos += 1;
                    let id = stack.pop().ok_or_else(|| self.error("unbalanced ')'"))?;
                    if tree.children(id).is_empty() {
                        return Err(self.error("empty subtree"));
                    }
                    if let Some(label) = self.parse_label()? {
                        tree.node_mut(id).label = Some(label);
                    }
                    if let Some(length) = self.parse_length()? {
                        tree.node_mut(id).edge_length = length;
                    }
                    if stack.is_empty() {
                        break id;
                    }
                }
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b';') => return Err(self.error("unexpected ';'")),
                Some(_) => {
                    let label = self
                        .parse_label()?
                        .ok_or_else(|| self.error("expected a label"))?;
                    let id = tree.new_node();
                    let taxon = ns.require(&label)?;
                    let node = tree.node_mut(id);
                    node.label = Some(label);
                    node.taxon = Some(taxon);
                    if let Some(top) = stack.last() {
                        tree.attach(*top, id);
                    }
                    if let Some(length) = self.parse_length()? {
                        tree.node_mut(id).edge_length = length;
                    }
                    if stack.is_empty() {
                        break id;
                    }
                }
                None => return Err(self.error("unexpected end of input")),
            }
        };
        self.skip_trivia()?;
        if self.peek() != Some(b';') {
            return Err(self.error("expected ';'"));
        }
        tree.root = root;
        Ok(tree)
    }
}

fn format_label(label: &str) -> String {
    let needs_quotes = label.contains(|c: char| "()[]':;,".contains(c)) || label.contains('_');
    if needs_quotes {
        format!("'{}'", label.replace('\'', "''"))
    } else if label.contains(' ') {
        label.replace(' ', "_")
    } else {
        label.to_string()
    }
}

fn push_annotations(tree: &Tree, id: NodeId, out: &mut String) {
    let node = tree.node(id);
    let mut fields: Vec<String> = vec![];
    if let Some(birth) = node.birth {
        fields.push(format!("birth={birth}"));
    }
    if let Some(death) = node.death {
        fields.push(format!("death={death}"));
    }
    if let Some(method) = node.creation_method {
        fields.push(format!("creation_method={}", method.as_str()));
    }
    if !fields.is_empty() {
        out.push_str(&format!("[&{}]", fields.join(",")));
    }
}

/// Newick serialization of the subtree at the root. Annotations (birth,
/// death, creation method) are written as `[&key=value]` comments.
pub fn newick_string(tree: &Tree, annotations: bool) -> String {
    enum Step {
        Open(NodeId),
        Close(NodeId),
        Comma,
    }
    let mut out = String::new();
    let mut stack = vec![Step::Open(tree.root())];
    while let Some(step) = stack.pop() {
        match step {
            Step::Open(id) => {
                if tree.is_leaf(id) {
                    if let Some(label) = &tree.node(id).label {
                        out.push_str(&format_label(label));
                    }
                    if annotations {
                        push_annotations(tree, id, &mut out);
                    }
                    if tree.parent(id).is_some() {
                        out.push_str(&format!(":{}", tree.node(id).edge_length));
                    }
                } else {
                    out.push('(');
                    stack.push(Step::Close(id));
                    let children = tree.children(id);
                    for (i, child) in children.iter().enumerate().rev() {
                        stack.push(Step::Open(*child));
                        if i > 0 {
                            stack.push(Step::Comma);
                        }
                    }
                }
            }
            Step::Close(id) => {
                out.push(')');
                if let Some(label) = &tree.node(id).label {
                    out.push_str(&format_label(label));
                }
                if annotations {
                    push_annotations(tree, id, &mut out);
                }
                if tree.parent(id).is_some() {
                    out.push_str(&format!(":{}", tree.node(id).edge_length));
                }
            }
            Step::Comma => out.push(','),
        }
    }
    out.push(';');
    out
}

pub fn write_newick(tree: &Tree, out: &mut dyn Write, annotations: bool) -> Result<(), TreeError> {
    writeln!(out, "{}", newick_string(tree, annotations))?;
    Ok(())
}

/// Nexus rendition: a TAXA block over the tips plus a single rooted tree.
pub fn write_nexus(tree: &Tree, out: &mut dyn Write, annotations: bool) -> Result<(), TreeError> {
    let tips: Vec<String> = tree
        .leaves(tree.root())
        .into_iter()
        .filter_map(|id| tree.node(id).label.as_deref().map(format_label))
        .collect();
    writeln!(out, "#NEXUS\n")?;
    writeln!(out, "BEGIN TAXA;")?;
    writeln!(out, "    DIMENSIONS NTAX={};", tips.len())?;
    writeln!(out, "    TAXLABELS")?;
    for tip in &tips {
        writeln!(out, "        {tip}")?;
    }
    writeln!(out, "    ;")?;
    writeln!(out, "END;\n")?;
    writeln!(out, "BEGIN TREES;")?;
    writeln!(
        out,
        "    TREE simulated = [&R] {}",
        newick_string(tree, annotations)
    )?;
    writeln!(out, "END;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut ns = TaxonNamespace::new();
        let tree = parse_newick("((A:1,B:1)ab:1,C:2):0;", &mut ns).unwrap();
        assert_eq!(newick_string(&tree, false), "((A:1,B:1)ab:1,C:2);");
    }

    #[test]
    fn test_underscores_and_quotes() {
        let mut ns = TaxonNamespace::new();
        let tree = parse_newick("(Homo_sapiens:1,'Pan (weird)':1);", &mut ns).unwrap();
        assert!(ns.get("Homo sapiens").is_some());
        assert!(ns.get("Pan (weird)").is_some());
        let text = newick_string(&tree, false);
        assert!(text.contains("Homo_sapiens"));
        assert!(text.contains("'Pan (weird)'"));
    }

    #[test]
    fn test_comments_are_skipped() {
        let mut ns = TaxonNamespace::new();
        let tree = parse_newick("((A[comment]:1,B:1):1,C:2);", &mut ns).unwrap();
        assert_eq!(tree.leaf_count(tree.root()), 3);
    }

    #[test]
    fn test_missing_lengths_default_to_zero() {
        let mut ns = TaxonNamespace::new();
        let tree = parse_newick("((A,B)Genus,C)Family;", &mut ns).unwrap();
        let a = tree.find_by_label("A").unwrap();
        assert_eq!(tree.node(a).edge_length, 0.0);
        assert_eq!(
            tree.node(tree.root()).label.as_deref(),
            Some("Family")
        );
    }

    #[test]
    fn test_parse_errors() {
        let mut ns = TaxonNamespace::new();
        assert!(parse_newick("((A:1,B:1):1", &mut ns).is_err());
        assert!(parse_newick("(A:1,B:1)", &mut ns).is_err());
        assert!(parse_newick("(A:x,B:1);", &mut ns).is_err());
    }

    #[test]
    fn test_annotations_rendered() {
        let mut ns = TaxonNamespace::new();
        let mut tree = parse_newick("((A:1,B:1):1,C:2);", &mut ns).unwrap();
        let a = tree.find_by_label("A").unwrap();
        let inner = tree.parent(a).unwrap();
        tree.node_mut(inner).birth = Some(0.5);
        tree.node_mut(inner).death = Some(0.25);
        let text = newick_string(&tree, true);
        assert!(text.contains("[&birth=0.5,death=0.25]"));
        assert!(!newick_string(&tree, false).contains("birth"));
    }

    #[test]
    fn test_nexus_shape() {
        let mut ns = TaxonNamespace::new();
        let tree = parse_newick("((A:1,B:1):1,C:2);", &mut ns).unwrap();
        let mut buf: Vec<u8> = vec![];
        write_nexus(&tree, &mut buf, false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("#NEXUS"));
        assert!(text.contains("DIMENSIONS NTAX=3;"));
        assert!(text.contains("TREE simulated = [&R] ((A:1,B:1):1,C:2);"));
    }
}
