//! Dialog text classification and the expected-dialog allow-list.
//!
//! Classification is a first-match walk over an ordered keyword table, so
//! a title like "确认删除并保存" lands on the earliest matching category.
//! Matching is case-insensitive over the concatenated title and content.

use serde::Serialize;

use crate::config::ExpectedDialog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    SaveConfirm,
    DeleteConfirm,
    ExitConfirm,
    Error,
    Warning,
    Information,
    Confirmation,
    Unknown,
}

impl DialogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DialogKind::SaveConfirm => "save_confirm",
            DialogKind::DeleteConfirm => "delete_confirm",
            DialogKind::ExitConfirm => "exit_confirm",
            DialogKind::Error => "error",
            DialogKind::Warning => "warning",
            DialogKind::Information => "information",
            DialogKind::Confirmation => "confirmation",
            DialogKind::Unknown => "unknown",
        }
    }
}

/// Ordered by precedence; the first category with a matching keyword wins.
const PRECEDENCE: &[(DialogKind, &[&str])] = &[
    (
        DialogKind::SaveConfirm,
        &["保存", "save", "是否保存", "do you want to save"],
    ),
    (
        DialogKind::DeleteConfirm,
        &["删除", "delete", "确认删除", "confirm delete"],
    ),
    (
        DialogKind::ExitConfirm,
        &["退出", "exit", "关闭", "close", "确认退出"],
    ),
    (
        DialogKind::Error,
        &["错误", "error", "失败", "failed", "异常", "exception"],
    ),
    (
        DialogKind::Warning,
        &["警告", "warning", "注意", "attention", "caution"],
    ),
    (
        DialogKind::Information,
        &["信息", "information", "提示", "info", "消息", "message"],
    ),
    (
        DialogKind::Confirmation,
        &["确认", "confirm", "确定", "ok", "是", "yes", "否", "no"],
    ),
];

pub fn classify(title: &str, content: &str) -> DialogKind {
    let text = format!("{title} {content}").to_lowercase();
    for (kind, keywords) in PRECEDENCE {
        if keywords.iter().any(|k| text.contains(k)) {
            return *kind;
        }
    }
    DialogKind::Unknown
}

/// Dialogs expected by the current workflow are acknowledged rather than
/// dismissed. Matches operator-configured patterns first, then a built-in
/// list of common save prompts.
pub struct ExpectationList {
    patterns: Vec<ExpectedDialog>,
}

const DEFAULT_EXPECTED: &[&str] = &[
    "是否保存",
    "do you want to save",
    "保存文件",
    "save file",
    "文档已修改",
    "document has been modified",
];

impl ExpectationList {
    pub fn new(patterns: Vec<ExpectedDialog>) -> Self {
        Self { patterns }
    }

    pub fn is_expected(&self, title: &str, content: &str) -> bool {
        let title = title.to_lowercase();
        let content = content.to_lowercase();
        for pattern in &self.patterns {
            let t = pattern.title.to_lowercase();
            let c = pattern.content.to_lowercase();
            // An empty pattern field would match everything; skip it.
            if (!t.is_empty() && title.contains(&t)) || (!c.is_empty() && content.contains(&c)) {
                return true;
            }
        }
        let text = format!("{title} {content}");
        DEFAULT_EXPECTED.iter().any(|p| text.contains(p))
    }
}

const DIALOG_CLASSES: &[&str] = &["#32770", "dialog", "messagebox", "msgbox", "confirm", "alert"];

const DIALOG_TITLE_KEYWORDS: &[&str] = &[
    "确认", "警告", "错误", "提示", "信息", "确定", "取消", "是", "否", "保存", "删除", "退出",
    "confirm", "warning", "error", "alert", "ok", "cancel", "yes", "no", "save", "delete", "exit",
    "close",
];

/// Cheap pre-filter applied before reading a window's content.
pub fn looks_like_dialog(class_name: &str, title: &str) -> bool {
    let class = class_name.to_lowercase();
    if DIALOG_CLASSES.iter().any(|c| class.contains(c)) {
        return true;
    }
    let title = title.to_lowercase();
    DIALOG_TITLE_KEYWORDS.iter().any(|k| title.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn precedence_first_match_wins() {
        // Contains both delete and save keywords; save comes first.
        assert_eq!(classify("确认删除并保存", ""), DialogKind::SaveConfirm);
        assert_eq!(classify("Confirm delete", ""), DialogKind::DeleteConfirm);
        assert_eq!(classify("", "do you want to save changes?"), DialogKind::SaveConfirm);
        assert_eq!(classify("警告", "磁盘空间不足"), DialogKind::Warning);
        assert_eq!(classify("Oops", "Operation failed"), DialogKind::Error);
        assert_eq!(classify("Totally unremarkable", ""), DialogKind::Unknown);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("SAVE Changes?", ""), DialogKind::SaveConfirm);
        assert_eq!(classify("ERROR", ""), DialogKind::Error);
    }

    #[test]
    fn operator_patterns_extend_the_allow_list() {
        let list = ExpectationList::new(vec![ExpectedDialog {
            title: "升级提示".to_string(),
            content: String::new(),
        }]);
        assert!(list.is_expected("升级提示", "anything"));
        assert!(!list.is_expected("删除确认", "确认删除该文件?"));
        // Built-in save prompts are always expected.
        assert!(list.is_expected("notepad", "Do you want to save changes?"));
    }

    #[test]
    fn empty_pattern_fields_never_match() {
        let list = ExpectationList::new(vec![ExpectedDialog::default()]);
        assert!(!list.is_expected("删除确认", "确认删除该文件?"));
    }

    #[test]
    fn unrecognized_dialogs_are_not_expected() {
        let list = ExpectationList::new(Vec::new());
        assert_eq!(classify("xyzzy", "plugh"), DialogKind::Unknown);
        assert!(!list.is_expected("xyzzy", "plugh"));
    }

    #[test]
    fn dialog_prefilter() {
        assert!(looks_like_dialog("#32770", "whatever"));
        assert!(looks_like_dialog("TMessageBox", ""));
        assert!(looks_like_dialog("Chrome_WidgetWin_1", "确认退出"));
        assert!(!looks_like_dialog("Chrome_WidgetWin_1", "New Tab"));
    }

    proptest! {
        // Appending text from lower-precedence categories never changes the
        // outcome for a save prompt.
        #[test]
        fn save_keyword_dominates(suffix in prop::sample::select(vec![
            "删除", "退出", "错误", "警告", "信息", "确认", "error", "warning",
        ])) {
            prop_assert_eq!(classify("保存", suffix), DialogKind::SaveConfirm);
        }

        // classify agrees with a naive reference walk over the same table.
        #[test]
        fn matches_reference_walk(title in "\\PC{0,20}", content in "\\PC{0,20}") {
            let text = format!("{title} {content}").to_lowercase();
            let expected = PRECEDENCE
                .iter()
                .find(|(_, keys)| keys.iter().any(|k| text.contains(k)))
                .map(|(kind, _)| *kind)
                .unwrap_or(DialogKind::Unknown);
            prop_assert_eq!(classify(&title, &content), expected);
        }
    }
}
