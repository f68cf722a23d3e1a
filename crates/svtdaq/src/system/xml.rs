// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `<system>` envelope: parsing incoming documents and writing variables.

use crate::error::{Error, Result};
use roxmltree::{Document, Node};
use std::fmt::Write as _;

/// One top-level child of a `<system>` document, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// A `<config>` block.
    Config {
        /// Leaf children of `<config>` as (name, trimmed text).
        leaves: Vec<(String, String)>,
        /// Source text of the whole `<config>` element.
        xml: String,
    },
    /// One command from a `<command>` block. Nested commands carry an
    /// `outer:inner` name, indexed elements `name(index)`.
    Command { name: String, arg: String },
}

/// Split a `<system>` document into its directives.
pub fn parse_envelope(text: &str) -> Result<Vec<Directive>> {
    let doc = Document::parse(text)?;
    let root = doc.root_element();
    if root.tag_name().name() != "system" {
        return Err(Error::Xml(format!(
            "root element is <{}>, expected <system>",
            root.tag_name().name()
        )));
    }

    let mut out = Vec::new();
    for child in root.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "config" => out.push(Directive::Config {
                leaves: child
                    .children()
                    .filter(|n| n.is_element() && !n.children().any(|c| c.is_element()))
                    .map(|n| (n.tag_name().name().to_string(), node_text(n)))
                    .collect(),
                xml: text[child.range()].to_string(),
            }),
            "command" => {
                let mut path = Vec::new();
                for cmd in child.children().filter(Node::is_element) {
                    collect_commands(cmd, &mut path, &mut out);
                }
            }
            other => log::debug!("[SYSTEM] Ignoring <{}> in system document", other),
        }
    }
    Ok(out)
}

fn collect_commands(node: Node<'_, '_>, path: &mut Vec<String>, out: &mut Vec<Directive>) {
    let name = node.tag_name().name();
    path.push(match node.attribute("index") {
        Some(idx) => format!("{}({})", name, idx),
        None => name.to_string(),
    });
    let mut children = node.children().filter(Node::is_element).peekable();
    if children.peek().is_none() {
        out.push(Directive::Command {
            name: path.join(":"),
            arg: node_text(node),
        });
    } else {
        for child in children {
            collect_commands(child, path, out);
        }
    }
    path.pop();
}

fn node_text(node: Node<'_, '_>) -> String {
    node.text().unwrap_or("").trim().to_string()
}

/// Escape text for element content.
#[must_use]
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Append `<name>value</name>\n`.
pub fn push_element(out: &mut String, name: &str, value: &str) {
    let _ = writeln!(out, "<{name}>{}</{name}>", escape(value));
}

/// Append `<error>message</error>\n`.
pub fn push_error(out: &mut String, message: &str) {
    push_element(out, "error", message);
}
