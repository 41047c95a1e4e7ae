//! 移动端元素选择器
//!
//! 在 CSS 属性选择器之上加了几种简写：
//! - `#"v"` → `[resource-id="v"]`，`."v"` → `[class="v"]`，`$"v"` → `[package="v"]`，`@N` → `[index="N"]`
//! - 简写后可跟运算符：`^` 前缀、`$` 后缀、`*` 包含，如 `#$"search_src_text"`
//! - 组合：空格为后代，`>` 为子元素，`,` 为并集
//!
//! 匹配遍历整棵树（包括根），结果按文档顺序。

use std::fmt;

use crate::core::EnvError;
use crate::device::UiNode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrOp {
    /// 仅要求属性存在
    Exists,
    Equals,
    Prefix,
    Suffix,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrCondition {
    pub name: String,
    pub op: AttrOp,
    pub value: String,
}

impl AttrCondition {
    fn matches(&self, node: &UiNode) -> bool {
        let Some(actual) = node.attr(&self.name) else {
            return false;
        };
        match self.op {
            AttrOp::Exists => true,
            AttrOp::Equals => actual == self.value,
            AttrOp::Prefix => actual.starts_with(&self.value),
            AttrOp::Suffix => actual.ends_with(&self.value),
            AttrOp::Contains => actual.contains(&self.value),
        }
    }
}

/// 复合选择器：可选标签名 + 若干属性条件
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    conditions: Vec<AttrCondition>,
}

impl Compound {
    fn matches(&self, node: &UiNode) -> bool {
        self.tag.as_ref().map_or(true, |t| *t == node.tag) && self.conditions.iter().all(|c| c.matches(node))
    }

    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.conditions.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

/// 复合选择器链；`combinators[i]` 连接 `compounds[i]` 与 `compounds[i + 1]`
#[derive(Clone, Debug, PartialEq, Eq)]
struct Chain {
    compounds: Vec<Compound>,
    combinators: Vec<Combinator>,
}

impl Chain {
    fn matches(&self, node: &UiNode, ancestors: &[&UiNode]) -> bool {
        self.matches_at(self.compounds.len() - 1, node, ancestors)
    }

    fn matches_at(&self, idx: usize, node: &UiNode, ancestors: &[&UiNode]) -> bool {
        if !self.compounds[idx].matches(node) {
            return false;
        }
        if idx == 0 {
            return true;
        }
        match self.combinators[idx - 1] {
            Combinator::Child => match ancestors.split_last() {
                Some((parent, rest)) => self.matches_at(idx - 1, parent, rest),
                None => false,
            },
            Combinator::Descendant => (0..ancestors.len())
                .rev()
                .any(|k| self.matches_at(idx - 1, ancestors[k], &ancestors[..k])),
        }
    }
}

/// 解析后的选择器（逗号并集）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    source: String,
    chains: Vec<Chain>,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, EnvError> {
        let mut parser = Parser {
            chars: input.chars().collect(),
            pos: 0,
            input,
        };
        let chains = parser.parse_group()?;
        Ok(Self {
            source: input.to_string(),
            chains,
        })
    }

    /// 多条选择器取并集，等价于用 `, ` 连接后解析
    pub fn parse_all<S: AsRef<str>>(parts: &[S]) -> Result<Self, EnvError> {
        let joined = parts.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ");
        Self::parse(&joined)
    }

    /// 按文档顺序返回全部匹配节点；无匹配返回空
    pub fn select<'a>(&self, root: &'a UiNode) -> Vec<&'a UiNode> {
        let mut out = Vec::new();
        let mut ancestors = Vec::new();
        self.walk(root, &mut ancestors, &mut out);
        out
    }

    fn walk<'a>(&self, node: &'a UiNode, ancestors: &mut Vec<&'a UiNode>, out: &mut Vec<&'a UiNode>) {
        if self.chains.iter().any(|c| c.matches(node, ancestors)) {
            out.push(node);
        }
        ancestors.push(node);
        for child in &node.children {
            self.walk(child, ancestors, out);
        }
        ancestors.pop();
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    input: &'a str,
}

impl Parser<'_> {
    fn error(&self, msg: impl fmt::Display) -> EnvError {
        EnvError::Selector(format!("{msg} at {} in '{}'", self.pos, self.input))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn parse_group(&mut self) -> Result<Vec<Chain>, EnvError> {
        let mut chains = Vec::new();
        loop {
            self.skip_ws();
            chains.push(self.parse_chain()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                None => return Ok(chains),
                Some(c) => return Err(self.error(format!("unexpected '{c}'"))),
            }
        }
    }

    fn parse_chain(&mut self) -> Result<Chain, EnvError> {
        let mut compounds = vec![self.parse_compound()?];
        let mut combinators = Vec::new();
        loop {
            let had_ws = self.skip_ws();
            let combinator = match self.peek() {
                Some('>') => {
                    self.pos += 1;
                    self.skip_ws();
                    Combinator::Child
                }
                Some(',') | None => break,
                Some(_) if had_ws => Combinator::Descendant,
                Some(c) => return Err(self.error(format!("unexpected '{c}'"))),
            };
            combinators.push(combinator);
            compounds.push(self.parse_compound()?);
        }
        Ok(Chain { compounds, combinators })
    }

    fn parse_compound(&mut self) -> Result<Compound, EnvError> {
        let mut compound = Compound::default();
        let universal = self.peek() == Some('*');
        if universal {
            self.pos += 1;
        } else if self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            compound.tag = Some(self.parse_ident());
        }
        loop {
            match self.peek() {
                Some(t @ ('#' | '.' | '$' | '@')) => {
                    self.pos += 1;
                    compound.conditions.push(self.parse_shorthand(t)?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.conditions.push(self.parse_bracket()?);
                }
                _ => break,
            }
        }
        if compound.is_empty() && !universal {
            return Err(self.error("empty selector"));
        }
        Ok(compound)
    }

    fn parse_shorthand(&mut self, kind: char) -> Result<AttrCondition, EnvError> {
        let name = match kind {
            '#' => "resource-id",
            '.' => "class",
            '$' => "package",
            _ => "index",
        };
        let mut op = AttrOp::Equals;
        if let Some(o @ ('^' | '$' | '*')) = self.peek() {
            if self.peek_at(1).is_some_and(|c| c == '"' || c.is_ascii_digit()) {
                self.pos += 1;
                op = match o {
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    _ => AttrOp::Contains,
                };
            }
        }
        let value = match self.peek() {
            Some('"') => self.parse_quoted()?,
            Some(c) if c.is_ascii_digit() => self.parse_digits(),
            _ => return Err(self.error(format!("expected quoted value after '{kind}'"))),
        };
        Ok(AttrCondition {
            name: name.to_string(),
            op,
            value,
        })
    }

    fn parse_bracket(&mut self) -> Result<AttrCondition, EnvError> {
        self.skip_ws();
        let name = self.parse_ident();
        if name.is_empty() {
            return Err(self.error("expected attribute name"));
        }
        self.skip_ws();
        let op = match (self.peek(), self.peek_at(1)) {
            (Some(']'), _) => {
                self.pos += 1;
                return Ok(AttrCondition {
                    name,
                    op: AttrOp::Exists,
                    value: String::new(),
                });
            }
            (Some('='), _) => {
                self.pos += 1;
                AttrOp::Equals
            }
            (Some(c @ ('^' | '$' | '*')), Some('=')) => {
                self.pos += 2;
                match c {
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    _ => AttrOp::Contains,
                }
            }
            _ => return Err(self.error("expected attribute operator")),
        };
        self.skip_ws();
        let value = match self.peek() {
            Some('"') => self.parse_quoted()?,
            _ => self.parse_ident(),
        };
        self.skip_ws();
        if self.peek() != Some(']') {
            return Err(self.error("expected ']'"));
        }
        self.pos += 1;
        Ok(AttrCondition { name, op, value })
    }

    fn parse_quoted(&mut self) -> Result<String, EnvError> {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '"' {
                let value: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                return Ok(value);
            }
            self.pos += 1;
        }
        Err(self.error("unterminated string"))
    }

    fn parse_digits(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn parse_ident(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ':'))
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}
