//! 槽的值管线：转换步骤（transform）、类型包装（cast）、窗口内折叠（reduce）
//!
//! 转换步骤是封闭的小语言，以字符串声明（如 `"index:0"`、`"scale:0.5"`、`"sub:/,//"`），
//! 解析后就是数据，不执行任何代码。

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::source::{as_number, value_text};

/// 单个转换步骤
#[derive(Clone, Debug)]
pub enum Transform {
    /// 数组下标，负数从尾部计
    Index(i64),
    First,
    Last,
    Len,
    Sum,
    Neg,
    Not,
    Scale(f64),
    Offset(f64),
    /// 正则替换：`sub:/pattern/replacement/`
    Sub(Regex, String),
    Lower,
    Upper,
    Trim,
    /// 把字符串解析为 JSON
    Json,
    /// 取对象字段
    Key(String),
    /// 包成 `{name: x}`
    Entry(String),
    Const(Value),
    Join(String),
    Split(String),
}

impl FromStr for Transform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((n, a)) => (n.trim(), Some(a)),
            None => (s.trim(), None),
        };
        let need_arg = || arg.ok_or_else(|| format!("transform '{name}' requires an argument"));
        let parse_f64 = |a: &str| {
            a.trim()
                .parse::<f64>()
                .map_err(|e| format!("transform '{name}': {e}"))
        };

        Ok(match name {
            "index" => Transform::Index(
                need_arg()?
                    .trim()
                    .parse()
                    .map_err(|e| format!("transform 'index': {e}"))?,
            ),
            "first" => Transform::First,
            "last" => Transform::Last,
            "len" => Transform::Len,
            "sum" => Transform::Sum,
            "neg" => Transform::Neg,
            "not" => Transform::Not,
            "scale" => Transform::Scale(parse_f64(need_arg()?)?),
            "offset" => Transform::Offset(parse_f64(need_arg()?)?),
            "sub" => {
                let body = need_arg()?;
                let mut parts = body.strip_prefix('/').unwrap_or(body).splitn(3, '/');
                let pattern = parts.next().unwrap_or_default();
                let replacement = parts
                    .next()
                    .ok_or_else(|| format!("transform 'sub' expects /pattern/replacement/, got '{body}'"))?;
                let re = Regex::new(pattern).map_err(|e| format!("transform 'sub': {e}"))?;
                Transform::Sub(re, replacement.to_string())
            }
            "lower" => Transform::Lower,
            "upper" => Transform::Upper,
            "trim" => Transform::Trim,
            "json" => Transform::Json,
            "key" => Transform::Key(need_arg()?.to_string()),
            "entry" => Transform::Entry(need_arg()?.to_string()),
            "const" => Transform::Const(
                serde_json::from_str(need_arg()?).map_err(|e| format!("transform 'const': {e}"))?,
            ),
            "join" => Transform::Join(arg.unwrap_or_default().to_string()),
            "split" => Transform::Split(need_arg()?.to_string()),
            other => return Err(format!("unknown transform '{other}'")),
        })
    }
}

impl<'de> Deserialize<'de> for Transform {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Index(i) => write!(f, "index:{i}"),
            Transform::Sub(re, rep) => write!(f, "sub:/{}/{rep}/", re.as_str()),
            Transform::Scale(x) => write!(f, "scale:{x}"),
            Transform::Offset(x) => write!(f, "offset:{x}"),
            Transform::Key(k) => write!(f, "key:{k}"),
            Transform::Entry(k) => write!(f, "entry:{k}"),
            Transform::Const(v) => write!(f, "const:{v}"),
            Transform::Join(s) => write!(f, "join:{s}"),
            Transform::Split(s) => write!(f, "split:{s}"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

impl Transform {
    pub fn apply(&self, x: Value) -> Result<Value, String> {
        match self {
            Transform::Index(i) => {
                let arr = expect_array(&x, self)?;
                let idx = if *i < 0 { arr.len() as i64 + i } else { *i };
                usize::try_from(idx)
                    .ok()
                    .and_then(|idx| arr.get(idx).cloned())
                    .ok_or_else(|| format!("index {i} out of range for {x}"))
            }
            Transform::First => expect_array(&x, self)?
                .first()
                .cloned()
                .ok_or_else(|| "first of empty array".to_string()),
            Transform::Last => expect_array(&x, self)?
                .last()
                .cloned()
                .ok_or_else(|| "last of empty array".to_string()),
            Transform::Len => match &x {
                Value::Array(a) => Ok(Value::from(a.len())),
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Object(o) => Ok(Value::from(o.len())),
                _ => Err(format!("len of non-collection {x}")),
            },
            Transform::Sum => {
                let mut total = 0.0;
                for v in expect_array(&x, self)? {
                    total += as_number(v).ok_or_else(|| format!("sum over non-number {v}"))?;
                }
                Ok(Value::from(total))
            }
            Transform::Neg => Ok(Value::from(-number(&x)?)),
            Transform::Not => Ok(Value::Bool(!truthy(&x))),
            Transform::Scale(k) => Ok(Value::from(number(&x)? * k)),
            Transform::Offset(k) => Ok(Value::from(number(&x)? + k)),
            Transform::Sub(re, rep) => {
                Ok(Value::String(re.replace_all(&value_text(&x), rep.as_str()).into_owned()))
            }
            Transform::Lower => Ok(Value::String(value_text(&x).to_lowercase())),
            Transform::Upper => Ok(Value::String(value_text(&x).to_uppercase())),
            Transform::Trim => Ok(Value::String(value_text(&x).trim().to_string())),
            Transform::Json => match &x {
                Value::String(s) => serde_json::from_str(s).map_err(|e| format!("json: {e}")),
                _ => Ok(x),
            },
            Transform::Key(k) => x
                .get(k)
                .cloned()
                .ok_or_else(|| format!("key '{k}' missing in {x}")),
            Transform::Entry(k) => {
                let mut obj = Map::new();
                obj.insert(k.clone(), x);
                Ok(Value::Object(obj))
            }
            Transform::Const(v) => Ok(v.clone()),
            Transform::Join(sep) => Ok(Value::String(
                expect_array(&x, self)?
                    .iter()
                    .map(value_text)
                    .collect::<Vec<_>>()
                    .join(sep),
            )),
            Transform::Split(sep) => Ok(Value::Array(
                value_text(&x)
                    .split(sep.as_str())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )),
        }
    }
}

/// 依次执行转换步骤
pub fn run_pipeline(steps: &[Transform], mut x: Value) -> Result<Value, String> {
    for step in steps {
        x = step.apply(x).map_err(|e| format!("{step}: {e}"))?;
    }
    Ok(x)
}

/// 输出类型包装
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cast {
    #[default]
    None,
    Float,
    Int,
    Str,
    Bool,
    List,
}

impl Cast {
    pub fn apply(self, x: Value) -> Result<Value, String> {
        match self {
            Cast::None => Ok(x),
            Cast::Float => Ok(Value::from(number(&x)?)),
            Cast::Int => Ok(Value::from(number(&x)?.trunc() as i64)),
            Cast::Str => Ok(Value::String(value_text(&x))),
            Cast::Bool => Ok(Value::Bool(truthy(&x))),
            Cast::List => Ok(match x {
                Value::Array(_) => x,
                other => Value::Array(vec![other]),
            }),
        }
    }
}

/// 同一窗口内多次激活的折叠方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduce {
    #[default]
    Latest,
    First,
    Sum,
    Max,
    Min,
    /// 数组拼接，保留最近 limit 个
    Concat,
    /// 对象按 key 合并，每个 key 的值拼接后保留最近 limit 个
    Merge,
}

impl Reduce {
    pub fn fold(self, acc: Value, next: Value, limit: usize) -> Result<Value, String> {
        match self {
            Reduce::Latest => Ok(next),
            Reduce::First => Ok(acc),
            Reduce::Sum => Ok(Value::from(number(&acc)? + number(&next)?)),
            Reduce::Max => Ok(Value::from(number(&acc)?.max(number(&next)?))),
            Reduce::Min => Ok(Value::from(number(&acc)?.min(number(&next)?))),
            Reduce::Concat => {
                let mut items = into_items(acc);
                items.extend(into_items(next));
                Ok(Value::Array(keep_tail(items, limit)))
            }
            Reduce::Merge => Ok(Value::Object(merge_objects(
                expect_object(acc)?,
                expect_object(next)?,
                limit,
            ))),
        }
    }

    /// 折叠一个窗口的全部值；空窗口返回 None
    pub fn fold_all(
        self,
        values: impl IntoIterator<Item = Value>,
        limit: usize,
    ) -> Result<Option<Value>, String> {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        // 单值也要走一遍规整（Concat 截断、Merge 校验对象）
        let mut acc = match self {
            Reduce::Concat => Value::Array(keep_tail(into_items(first), limit)),
            Reduce::Merge => Value::Object(merge_objects(Map::new(), expect_object(first)?, limit)),
            _ => first,
        };
        for v in iter {
            acc = self.fold(acc, v, limit)?;
        }
        Ok(Some(acc))
    }
}

/// 按 key 合并两个对象：值视为列表拼接，每个 key 只保留最近 limit 个
pub fn merge_objects(mut base: Map<String, Value>, other: Map<String, Value>, limit: usize) -> Map<String, Value> {
    for (k, v) in other {
        let mut items = base.remove(&k).map(into_items).unwrap_or_default();
        items.extend(into_items(v));
        base.insert(k, Value::Array(keep_tail(items, limit)));
    }
    base
}

fn into_items(v: Value) -> Vec<Value> {
    match v {
        Value::Array(a) => a,
        other => vec![other],
    }
}

fn keep_tail(mut items: Vec<Value>, limit: usize) -> Vec<Value> {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

fn expect_array<'a>(x: &'a Value, step: &Transform) -> Result<&'a Vec<Value>, String> {
    x.as_array()
        .ok_or_else(|| format!("{step} expects an array, got {x}"))
}

fn expect_object(x: Value) -> Result<Map<String, Value>, String> {
    match x {
        Value::Object(o) => Ok(o),
        Value::Null => Ok(Map::new()),
        other => Err(format!("expected an object, got {other}")),
    }
}

fn number(x: &Value) -> Result<f64, String> {
    as_number(x).ok_or_else(|| format!("not a number: {x}"))
}

fn truthy(x: &Value) -> bool {
    match x {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(specs: &[&str]) -> Vec<Transform> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_parse_unknown_transform() {
        assert!("eval:x+1".parse::<Transform>().is_err());
        assert!("index".parse::<Transform>().is_err());
        assert!("scale:abc".parse::<Transform>().is_err());
    }

    #[test]
    fn test_pipeline_extracts_score() {
        let pipeline = steps(&["index:0", "sub:/,//", "scale:2"]);
        let out = run_pipeline(&pipeline, json!(["1,024"])).unwrap();
        assert_eq!(out, json!(2048.0));
    }

    #[test]
    fn test_negative_index() {
        let out = run_pipeline(&steps(&["index:-1"]), json!(["a", "b", "c"])).unwrap();
        assert_eq!(out, json!("c"));
        assert!(run_pipeline(&steps(&["index:5"]), json!(["a"])).is_err());
    }

    #[test]
    fn test_entry_builds_extras_map() {
        let out = run_pipeline(&steps(&["first", "entry:item"]), json!(["book"])).unwrap();
        assert_eq!(out, json!({"item": "book"}));
    }

    #[test]
    fn test_cast() {
        assert_eq!(Cast::Float.apply(json!("3")).unwrap(), json!(3.0));
        assert_eq!(Cast::Int.apply(json!(3.7)).unwrap(), json!(3));
        assert_eq!(Cast::Bool.apply(json!("")).unwrap(), json!(false));
        assert_eq!(Cast::List.apply(json!(1)).unwrap(), json!([1]));
        assert!(Cast::Float.apply(json!(["x"])).is_err());
    }

    #[test]
    fn test_reduce_latest_and_sum() {
        let latest = Reduce::Latest.fold_all(vec![json!(3.0), json!(5.0)], 100).unwrap();
        assert_eq!(latest, Some(json!(5.0)));
        let sum = Reduce::Sum.fold_all(vec![json!(1.0), json!(2.5)], 100).unwrap();
        assert_eq!(sum, Some(json!(3.5)));
        assert_eq!(Reduce::Sum.fold_all(Vec::new(), 100).unwrap(), None);
    }

    #[test]
    fn test_merge_bounded_per_key() {
        let values = vec![
            json!({"a": 1}),
            json!({"a": [2, 3], "b": "x"}),
            json!({"a": 4}),
        ];
        let merged = Reduce::Merge.fold_all(values, 3).unwrap().unwrap();
        assert_eq!(merged, json!({"a": [2, 3, 4], "b": ["x"]}));
    }

    #[test]
    fn test_concat_bounded() {
        let values = vec![json!("a"), json!(["b", "c"]), json!("d")];
        let out = Reduce::Concat.fold_all(values, 2).unwrap().unwrap();
        assert_eq!(out, json!(["c", "d"]));
    }
}
