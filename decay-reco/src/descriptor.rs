//! Decay descriptors
//!
//! Parses strings such as `^B-:ch1 -> [^D+ -> ^K- ^pi+ ^pi+] ^pi- ^pi-` into a
//! tree of labels. A `^` marks a particle that gets a role in the output table;
//! square brackets hold a nested decay.

use crate::particles;
use crate::types::{PipelineError, Result};
use std::fmt;

/// One node of a parsed decay descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorNode {
    /// List label, possibly with a `:suffix`
    pub label: String,
    /// Marked with `^`
    pub selected: bool,
    /// Empty for particles whose decay is not spelled out
    pub daughters: Vec<DescriptorNode>,
}

impl DescriptorNode {
    /// Species name without the list suffix
    pub fn species(&self) -> &str {
        particles::species_name(&self.label)
    }

    /// Selected nodes in pre-order together with their tree paths
    ///
    /// The path of the root is empty; `[0, 2]` is the third daughter of the first
    /// daughter.
    pub fn selected_paths(&self) -> Vec<(Vec<usize>, &DescriptorNode)> {
        let mut out = Vec::new();
        self.collect_selected(&mut Vec::new(), &mut out);
        out
    }

    fn collect_selected<'a>(
        &'a self,
        path: &mut Vec<usize>,
        out: &mut Vec<(Vec<usize>, &'a DescriptorNode)>,
    ) {
        if self.selected {
            out.push((path.clone(), self));
        }
        for (i, daughter) in self.daughters.iter().enumerate() {
            path.push(i);
            daughter.collect_selected(path, out);
            path.pop();
        }
    }

    /// Number of nodes in the tree
    pub fn size(&self) -> usize {
        1 + self.daughters.iter().map(|d| d.size()).sum::<usize>()
    }
}

impl fmt::Display for DescriptorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.selected {
            write!(f, "^")?;
        }
        write!(f, "{}", self.label)?;
        if !self.daughters.is_empty() {
            write!(f, " ->")?;
            for d in &self.daughters {
                if d.daughters.is_empty() {
                    write!(f, " {}", d)?;
                } else {
                    write!(f, " [{}]", d)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Caret,
    Arrow,
    Open,
    Close,
    Label(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '^' => {
                chars.next();
                tokens.push(Token::Caret);
            }
            '[' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ']' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '-' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Arrow);
                } else {
                    return Err(PipelineError::MalformedPattern(format!(
                        "stray '-' in descriptor '{}'",
                        text
                    )));
                }
            }
            _ => {
                let mut label = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '^' | '[' | ']') {
                        break;
                    }
                    // A trailing charge sign is part of the label, an arrow is not
                    if c == '-' {
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek() == Some(&'>') {
                            break;
                        }
                    }
                    label.push(c);
                    chars.next();
                }
                tokens.push(Token::Label(label));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    text: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, what: &str) -> PipelineError {
        PipelineError::MalformedPattern(format!("{} in descriptor '{}'", what, self.text))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn particle(&mut self) -> Result<(String, bool)> {
        let selected = if self.peek() == Some(&Token::Caret) {
            self.pos += 1;
            true
        } else {
            false
        };
        match self.tokens.get(self.pos) {
            Some(Token::Label(label)) => {
                let label = label.clone();
                self.pos += 1;
                Ok((label, selected))
            }
            _ => Err(self.error("expected a particle label")),
        }
    }

    fn decay(&mut self) -> Result<DescriptorNode> {
        let (label, selected) = self.particle()?;
        if self.peek() != Some(&Token::Arrow) {
            return Err(self.error("expected '->'"));
        }
        self.pos += 1;

        let mut daughters = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Open) => {
                    self.pos += 1;
                    let nested = self.decay()?;
                    if self.peek() != Some(&Token::Close) {
                        return Err(self.error("expected ']'"));
                    }
                    self.pos += 1;
                    daughters.push(nested);
                }
                Some(Token::Caret) | Some(Token::Label(_)) => {
                    let (label, selected) = self.particle()?;
                    daughters.push(DescriptorNode { label, selected, daughters: Vec::new() });
                }
                _ => break,
            }
        }
        if daughters.is_empty() {
            return Err(self.error("decay without daughters"));
        }
        Ok(DescriptorNode { label, selected, daughters })
    }
}

/// Parse a decay descriptor
pub fn parse(text: &str) -> Result<DescriptorNode> {
    let mut parser = Parser { tokens: tokenize(text)?, pos: 0, text };
    let root = parser.decay()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing input"));
    }
    Ok(root)
}
