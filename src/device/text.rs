//! 文本输入：词表 token → 按键序列

use crate::core::EnvError;

/// 一次按键或一段字面文本
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyStroke {
    Text(String),
    Key(&'static str),
}

/// 结束输入法组合、且不改变文本内容的哨兵按键
pub const FLUSH_KEY: &str = "KEYCODE_UNKNOWN";

const SHELL_SPECIAL: &[char] = &[
    '\\', '\'', '"', '`', '$', '&', '|', ';', '<', '>', '(', ')', '*', '?', '~', '#', '!', '[', ']', '{', '}',
];

#[derive(Clone, Debug, Default)]
pub struct TextMapper {
    vocabulary: Vec<String>,
}

impl TextMapper {
    pub fn new(vocabulary: Vec<String>) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    pub fn strokes(&self, token: u32) -> Result<Vec<KeyStroke>, EnvError> {
        let word = self
            .vocabulary
            .get(token as usize)
            .ok_or_else(|| EnvError::StepCommand(format!("input token {token} out of vocabulary")))?;
        Ok(strokes_for(word))
    }
}

fn named_key(c: char) -> Option<&'static str> {
    match c {
        '\n' => Some("KEYCODE_ENTER"),
        '\t' => Some("KEYCODE_TAB"),
        '\u{8}' => Some("KEYCODE_DEL"),
        ' ' => Some("KEYCODE_SPACE"),
        _ => None,
    }
}

pub fn strokes_for(word: &str) -> Vec<KeyStroke> {
    let mut strokes = Vec::new();
    let mut run = String::new();
    for c in word.chars() {
        if let Some(key) = named_key(c) {
            if !run.is_empty() {
                strokes.push(KeyStroke::Text(std::mem::take(&mut run)));
            }
            strokes.push(KeyStroke::Key(key));
        } else if c.is_control() {
            // 其它不可见字符无法通过 input text 送达
            continue;
        } else {
            if SHELL_SPECIAL.contains(&c) {
                run.push('\\');
            }
            run.push(c);
        }
    }
    if !run.is_empty() {
        strokes.push(KeyStroke::Text(run));
    }
    strokes.push(KeyStroke::Key(FLUSH_KEY));
    strokes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strokes_split_named_keys() {
        assert_eq!(
            strokes_for("how to\n"),
            vec![
                KeyStroke::Text("how".to_string()),
                KeyStroke::Key("KEYCODE_SPACE"),
                KeyStroke::Text("to".to_string()),
                KeyStroke::Key("KEYCODE_ENTER"),
                KeyStroke::Key(FLUSH_KEY),
            ]
        );
    }

    #[test]
    fn test_strokes_escape_shell_chars() {
        assert_eq!(
            strokes_for("it's"),
            vec![KeyStroke::Text("it\\'s".to_string()), KeyStroke::Key(FLUSH_KEY)]
        );
    }

    #[test]
    fn test_token_out_of_vocabulary() {
        let mapper = TextMapper::new(vec!["cake".to_string()]);
        assert_eq!(mapper.strokes(0).unwrap().len(), 2);
        assert!(matches!(mapper.strokes(5), Err(EnvError::StepCommand(_))));
    }
}
