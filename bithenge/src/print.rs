//! Pretty printing of decoded trees.

use std::fmt;
use std::ops::ControlFlow;

use bithenge_tree::{Blob, Node, Result};

/// Output flavor of the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintFormat {
    /// JSON-style: `true`/`false`, all keys quoted.
    Json,
    /// Python-style: `True`/`False`, blobs as `b"…"`.
    Python,
}

struct Printer<'a, W: fmt::Write> {
    out: &'a mut W,
    format: PrintFormat,
    depth: usize,
}

impl<W: fmt::Write> Printer<'_, W> {
    fn node(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::Boolean(value) => {
                let text = match (self.format, value) {
                    (PrintFormat::Json, true) => "true",
                    (PrintFormat::Json, false) => "false",
                    (PrintFormat::Python, true) => "True",
                    (PrintFormat::Python, false) => "False",
                };
                self.out.write_str(text)?;
            }
            Node::Integer(value) => write!(self.out, "{value}")?,
            Node::String(value) => self.string(value)?,
            Node::Blob(blob) => self.blob(blob.as_ref())?,
            Node::Internal(_) => self.internal(node)?,
        }
        Ok(())
    }

    fn string(&mut self, value: &str) -> Result<()> {
        self.out.write_char('"')?;
        for ch in value.chars() {
            if ch == '"' || ch == '\\' {
                self.out.write_char('\\')?;
                self.out.write_char(ch)?;
            } else if (ch as u32) <= 0x1f {
                write!(self.out, "\\u{:04x}", ch as u32)?;
            } else {
                self.out.write_char(ch)?;
            }
        }
        self.out.write_char('"')?;
        Ok(())
    }

    fn blob(&mut self, blob: &dyn Blob) -> Result<()> {
        if self.format == PrintFormat::Python {
            self.out.write_char('b')?;
        }
        self.out.write_char('"')?;
        let mut buf = [0u8; 1024];
        let mut offset = 0u64;
        loop {
            let n = blob.read(offset, &mut buf)?;
            for byte in &buf[..n] {
                write!(self.out, "\\x{byte:02x}")?;
            }
            if n < buf.len() {
                break;
            }
            offset += n as u64;
        }
        self.out.write_char('"')?;
        Ok(())
    }

    fn newline(&mut self) -> Result<()> {
        self.out.write_char('\n')?;
        for _ in 0..self.depth {
            self.out.write_str("    ")?;
        }
        Ok(())
    }

    fn internal(&mut self, node: &Node) -> Result<()> {
        self.out.write_char('{')?;
        self.depth += 1;
        let mut first = true;
        let _ = node.for_each(&mut |key, value| {
            if !first {
                self.out.write_char(',')?;
            }
            self.newline()?;
            first = false;
            // JSON keys are always strings.
            let quote_key =
                self.format == PrintFormat::Json && !matches!(key, Node::String(_));
            if quote_key {
                self.out.write_char('"')?;
            }
            self.node(&key)?;
            if quote_key {
                self.out.write_char('"')?;
            }
            self.out.write_str(": ")?;
            self.node(&value)?;
            Ok(ControlFlow::Continue(()))
        })?;
        self.depth -= 1;
        if !first {
            self.newline()?;
        }
        self.out.write_char('}')?;
        Ok(())
    }
}

/// Print a tree into a `fmt::Write` sink.
pub fn write_node<W: fmt::Write>(out: &mut W, format: PrintFormat, node: &Node) -> Result<()> {
    Printer {
        out,
        format,
        depth: 0,
    }
    .node(node)
}

/// Print a tree to a string.
pub fn node_to_string(format: PrintFormat, node: &Node) -> Result<String> {
    let mut out = String::new();
    write_node(&mut out, format, node)?;
    Ok(out)
}

/// Print a tree to standard output, with no trailing newline.
pub fn print_node(format: PrintFormat, node: &Node) -> Result<()> {
    let text = node_to_string(format, node)?;
    print!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bithenge_tree::{blob_from_data, simple_internal};

    #[test]
    fn booleans_differ_by_flavor() {
        let node = Node::Boolean(true);
        assert_eq!(node_to_string(PrintFormat::Json, &node).unwrap(), "true");
        assert_eq!(node_to_string(PrintFormat::Python, &node).unwrap(), "True");
    }

    #[test]
    fn strings_escape_quotes_and_control_characters() {
        let node = Node::string("a\"b\\c\nd");
        assert_eq!(
            node_to_string(PrintFormat::Json, &node).unwrap(),
            "\"a\\\"b\\\\c\\u000ad\""
        );
    }

    #[test]
    fn blobs_print_as_hex_escapes() {
        let node = blob_from_data(&[0x00, 0xff]);
        assert_eq!(
            node_to_string(PrintFormat::Json, &node).unwrap(),
            r#""\x00\xff""#
        );
        assert_eq!(
            node_to_string(PrintFormat::Python, &node).unwrap(),
            r#"b"\x00\xff""#
        );
    }

    #[test]
    fn empty_internal_prints_as_braces() {
        assert_eq!(
            node_to_string(PrintFormat::Json, &Node::empty_internal()).unwrap(),
            "{}"
        );
    }

    #[test]
    fn internal_nodes_indent_and_quote_keys() {
        let inner = simple_internal(vec![(Node::Integer(0), Node::Boolean(false))]);
        let node = simple_internal(vec![
            (Node::string("name"), Node::string("x")),
            (Node::string("inner"), inner),
        ]);
        let expected = "{\n    \"name\": \"x\",\n    \"inner\": {\n        \"0\": false\n    }\n}";
        assert_eq!(node_to_string(PrintFormat::Json, &node).unwrap(), expected);
    }

    #[test]
    fn python_keys_keep_their_own_form() {
        let node = simple_internal(vec![(Node::Integer(1), Node::Integer(2))]);
        assert_eq!(
            node_to_string(PrintFormat::Python, &node).unwrap(),
            "{\n    1: 2\n}"
        );
    }
}
