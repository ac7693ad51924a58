// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTML documents as browsers see them
//!
//! Parsing follows the HTML5 tree construction rules (via `scraper`), so implied end tags,
//! missing `<html>`/`<head>`/`<body>` elements and misnested markup produce the same tree a
//! browser would build. Only invalid UTF-8 makes parsing fail.

use scraper::{ElementRef, Html, Node};
use std::fmt::Display;
use std::str::Utf8Error;

/// The error type returned when a document cannot be parsed
#[derive(Debug)]
pub struct HtmlParseError(Utf8Error);

impl Display for HtmlParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Document is not valid UTF-8: {}", self.0)
    }
}

impl std::error::Error for HtmlParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// A parsed HTML document
#[derive(Debug)]
pub struct Document(Html);

impl Document {
    /// Parses a complete document.
    pub fn parse(bytes: &[u8]) -> Result<Self, HtmlParseError> {
        let html = std::str::from_utf8(bytes).map_err(HtmlParseError)?;
        Ok(Self(Html::parse_document(html)))
    }

    /// Serializes the document.
    pub fn to_html(&self) -> String {
        self.0.html()
    }

    /// Lists all elements with one of the given lowercase names, depth-first in document order.
    pub fn find_elements(&self, names: &[&str]) -> Vec<ElementRef<'_>> {
        self.0
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|element| names.contains(&element.value().name()))
            .collect()
    }

    fn body(&self) -> Option<ElementRef<'_>> {
        self.0
            .root_element()
            .children()
            .filter_map(ElementRef::wrap)
            .find(|element| element.value().name() == "body")
    }

    /// Inserts a `<script>` element with the given source code as the first child of `<body>`.
    /// Frameset documents have no body, the script is appended to the root element then.
    ///
    /// `source` must not contain `</script`.
    pub fn insert_script(&mut self, source: &str) {
        let fragment = Html::parse_fragment(&format!("<script>{source}</script>"));
        let Some(script) = fragment
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .find(|element| element.value().name() == "script")
        else {
            return;
        };
        let element = Node::Element(script.value().clone());
        let children: Vec<Node> = script.children().map(|child| child.value().clone()).collect();

        let (parent, has_body) = match self.body() {
            Some(body) => (body.id(), true),
            None => (self.0.root_element().id(), false),
        };
        let Some(mut parent) = self.0.tree.get_mut(parent) else {
            return;
        };
        let mut script = if has_body {
            parent.prepend(element)
        } else {
            parent.append(element)
        };
        for child in children {
            script.append(child);
        }
    }
}
