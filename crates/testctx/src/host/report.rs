use std::{fmt::Write as _, time::Duration};

/// 单元的最终结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Passed => "PASS",
            Outcome::Failed => "FAIL",
            Outcome::Skipped => "SKIP",
        }
    }
}

/// 单元及其子单元的运行报告，子单元按完成登记的顺序排列。
#[derive(Clone, Debug)]
pub struct Report {
    pub(super) name: String,
    pub(super) outcome: Outcome,
    pub(super) output: Vec<String>,
    pub(super) children: Vec<Report>,
    pub(super) elapsed: Duration,
}

impl Report {
    /// 宿主线程无法启动或异常终止时生成的失败报告。
    pub(super) fn aborted(name: &str, reason: String) -> Self {
        Self {
            name: name.to_owned(),
            outcome: Outcome::Failed,
            output: vec![reason],
            children: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    pub fn failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }

    pub fn skipped(&self) -> bool {
        self.outcome == Outcome::Skipped
    }

    /// 单元通过 `log`/`error`/`fatal`/`skip` 记录的消息。
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn children(&self) -> &[Report] {
        &self.children
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// 按完整名在整棵报告树中查找。
    pub fn find(&self, name: &str) -> Option<&Report> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// 先序遍历的完整名列表（包含自身）。
    pub fn names(&self) -> Vec<&str> {
        let mut names = vec![self.name.as_str()];
        for child in &self.children {
            names.extend(child.names());
        }
        names
    }

    /// 渲染为 `--- PASS: name (0.00s)` 风格的缩进文本。
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        let _ = writeln!(
            out,
            "{indent}--- {}: {} ({:.2}s)",
            self.outcome.label(),
            self.name,
            self.elapsed.as_secs_f64()
        );
        for line in &self.output {
            let _ = writeln!(out, "{indent}    {line}");
        }
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }

    /// 报告失败时以渲染文本 panic，供 `#[test]` 函数使用。
    #[track_caller]
    pub fn assert_passed(&self) {
        if self.failed() {
            panic!("testctx unit failed:\n{}", self.render());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, outcome: Outcome) -> Report {
        Report {
            name: name.into(),
            outcome,
            output: Vec::new(),
            children: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn render_nests_children_and_output() {
        let mut root = leaf("Root", Outcome::Failed);
        let mut child = leaf("Root/a", Outcome::Failed);
        child.output.push("boom".into());
        root.children.push(child);
        root.children.push(leaf("Root/b", Outcome::Skipped));

        assert_eq!(
            root.render(),
            "--- FAIL: Root (0.00s)\n    --- FAIL: Root/a (0.00s)\n        boom\n    --- SKIP: Root/b (0.00s)\n"
        );
        assert_eq!(root.names(), vec!["Root", "Root/a", "Root/b"]);
        assert!(root.find("Root/b").is_some_and(Report::skipped));
    }
}
