//! Conditional G-code file interpreter.
//!
//! Reads a file as a stream of codes, handling the flow-control keywords
//! (`if`/`elif`/`else`/`while`/`break`/`continue`/`var`/`global`/`set`/
//! `echo`/`abort`/`return`) through a stack of [`CodeBlock`]s. Expression
//! evaluation is an injected capability; the interpreter never embeds the
//! evaluator's logic.
//!
//! The interpreter is polled: [`FileInterpreter::read_code`] returns
//! `Read::NotReady` instead of blocking when a loop re-entry or an `abort`
//! needs the channel's previously emitted codes to finish first. The
//! owning file runner flushes the channel and retries.

mod block;
mod reader;

pub use block::CodeBlock;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::codes::{parse_line, Channel, Code, CodeFlags, CodeType, Keyword};
use crate::error::{Error, Result};
use crate::scheduler::{HostAction, Queues};

use reader::LineReader;

/// Evaluation context handed to the expression evaluator alongside the
/// expression itself.
pub struct EvalContext<'a> {
    pub code: &'a Code,
    /// Innermost loop counter, when evaluating inside a `while`.
    pub iterations: Option<u64>,
}

/// Injected expression evaluation capability.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        context: EvalContext<'_>,
        expression: &str,
        expect_bool: bool,
    ) -> Result<String>;
}

/// Outcome of one poll of the interpreter.
#[derive(Debug)]
pub enum Read {
    /// The next executable code.
    Code(Code),
    /// Emitted codes must finish before the file can continue; retry later.
    NotReady,
    /// End of file.
    Eof,
}

enum Phase {
    Reading,
    /// A loop pass ended; waiting for the channel to drain, then seeking
    /// back to the `while` line at the top of the stack.
    AwaitingReseek,
    /// An `abort`/`return` was hit; waiting for the drain, then delivering
    /// the code itself so the caller can propagate it.
    AwaitingClose(Box<Code>),
    Closed,
}

pub struct FileInterpreter {
    channel: Channel,
    /// Opened on behalf of the firmware (macro request), not a user.
    system: bool,
    display_name: String,
    reader: LineReader,
    stack: Vec<CodeBlock>,
    /// Indent and `expecting_else` of the conditional block popped last,
    /// for pairing a following `elif`/`else` at the same indent.
    last_conditional: Option<(u8, bool)>,
    /// `var` declarations at file scope, deleted when the file closes.
    file_locals: Vec<String>,
    phase: Phase,
    queues: Arc<Queues>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl FileInterpreter {
    pub async fn open(
        path: &Path,
        channel: Channel,
        system: bool,
        queues: Arc<Queues>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Result<Self> {
        let reader = LineReader::open(path).await?;
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            channel,
            system,
            display_name,
            reader,
            stack: Vec::new(),
            last_conditional: None,
            file_locals: Vec::new(),
            phase: Phase::Reading,
            queues,
            evaluator,
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn name(&self) -> &str {
        &self.display_name
    }

    /// Byte offset of the next unread line.
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    pub fn line_number(&self) -> Option<u64> {
        self.reader.line_number()
    }

    /// Seek the underlying stream. Seeking to 0 restores line counting from
    /// 1; any other target leaves the line number unknown.
    pub async fn set_position(&mut self, position: u64) -> Result<()> {
        let line_number = (position == 0).then_some(1);
        self.reader.seek(position, line_number).await?;
        Ok(())
    }

    /// Innermost `while` iteration counter, or `None` outside a loop.
    pub fn get_iterations(&self) -> Option<u64> {
        self.stack.iter().rev().find(|b| b.is_loop()).map(|b| b.iterations)
    }

    /// Stop reading; pending blocks are discarded, file locals dropped.
    pub fn close(&mut self) {
        self.teardown_locals();
        self.phase = Phase::Closed;
    }

    /// Poll the next executable code out of the file.
    pub async fn read_code(&mut self) -> Result<Read> {
        loop {
            match &mut self.phase {
                Phase::Closed => return Ok(Read::Eof),
                Phase::AwaitingReseek => {
                    if !self.queues.channel_idle(self.channel) {
                        return Ok(Read::NotReady);
                    }
                    self.perform_reseek().await?;
                    self.phase = Phase::Reading;
                }
                Phase::AwaitingClose(_) => {
                    if !self.queues.channel_idle(self.channel) {
                        return Ok(Read::NotReady);
                    }
                    let Phase::AwaitingClose(code) =
                        std::mem::replace(&mut self.phase, Phase::Closed)
                    else {
                        unreachable!()
                    };
                    self.teardown_locals();
                    return Ok(Read::Code(*code));
                }
                Phase::Reading => {}
            }

            let Some(line) = self.reader.read_line().await? else {
                if self.reconcile_eof()? {
                    continue;
                }
                self.teardown_locals();
                self.phase = Phase::Closed;
                return Ok(Read::Eof);
            };

            let mut code = parse_line(&line.text).map_err(|message| {
                Error::code_parser(&self.display_name, line.number.unwrap_or(0), message)
            })?;
            code.channel = self.channel;
            code.file_position = Some(line.position);
            code.line_number = line.number;
            code.length = Some(line.length);
            code.flags |= CodeFlags::FROM_MACRO;

            // Blank and comment lines flow past the block logic untouched.
            if code.is_empty_or_comment() {
                continue;
            }

            if self.reconcile(&code)? {
                continue;
            }

            match self.handle_code(code).await? {
                Some(read) => return Ok(read),
                None => continue,
            }
        }
    }

    // ------------------------------------------------------------------
    // Block reconciliation
    // ------------------------------------------------------------------

    /// Pop blocks the new code has dedented out of. Returns `true` when a
    /// loop re-entry was scheduled and the code must be re-read later.
    fn reconcile(&mut self, code: &Code) -> Result<bool> {
        while let Some(top) = self.stack.last() {
            if top.indent < code.indent {
                break;
            }
            // The while line itself, re-read after a seek-back.
            if top.is_loop() && code.file_position == Some(top.start_position) {
                break;
            }
            if top.is_loop() && (top.process_block || top.continue_loop) {
                if top.process_block && !top.seen_codes {
                    return Err(Error::code_parser(
                        &self.display_name,
                        top.start_line.unwrap_or(0),
                        "empty while body",
                    ));
                }
                self.phase = Phase::AwaitingReseek;
                return Ok(true);
            }
            self.pop_block();
        }
        Ok(false)
    }

    fn reconcile_eof(&mut self) -> Result<bool> {
        while let Some(top) = self.stack.last() {
            if top.is_loop() && (top.process_block || top.continue_loop) {
                if top.process_block && !top.seen_codes {
                    return Err(Error::code_parser(
                        &self.display_name,
                        top.start_line.unwrap_or(0),
                        "empty while body",
                    ));
                }
                self.phase = Phase::AwaitingReseek;
                return Ok(true);
            }
            self.pop_block();
        }
        Ok(false)
    }

    async fn perform_reseek(&mut self) -> Result<()> {
        let Some(top) = self.stack.last_mut() else {
            return Ok(());
        };
        debug!(
            file = %self.display_name,
            iteration = top.iterations + 1,
            "looping back to byte {}",
            top.start_position
        );
        self.reader.seek(top.start_position, top.start_line).await?;
        top.iterations += 1;
        top.continue_loop = false;
        Ok(())
    }

    fn pop_block(&mut self) {
        let Some(block) = self.stack.pop() else {
            return;
        };
        for name in &block.locals {
            self.queues.push_action(HostAction::DeleteLocal {
                channel: self.channel,
                name: name.clone(),
            });
        }
        self.last_conditional = match block.keyword {
            Keyword::If | Keyword::ElseIf => Some((block.indent, block.expecting_else)),
            _ => None,
        };
    }

    fn teardown_locals(&mut self) {
        while !self.stack.is_empty() {
            self.pop_block();
        }
        for name in self.file_locals.drain(..) {
            self.queues.push_action(HostAction::DeleteLocal {
                channel: self.channel,
                name,
            });
        }
    }

    // ------------------------------------------------------------------
    // Code handling
    // ------------------------------------------------------------------

    /// Every enclosing block takes its branch.
    fn active(&self) -> bool {
        self.stack.iter().all(|b| b.process_block)
    }

    fn mark_seen(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.seen_codes = true;
        }
    }

    async fn handle_code(&mut self, mut code: Code) -> Result<Option<Read>> {
        if code.code_type != CodeType::Keyword {
            if !self.active() {
                return Ok(None);
            }
            self.last_conditional = None;
            self.mark_seen();
            self.resolve_parameters(&mut code).await?;
            return Ok(Some(Read::Code(code)));
        }

        let keyword = code.keyword.unwrap_or(Keyword::Echo);
        match keyword {
            Keyword::If => {
                let process = self.active()
                    && self.evaluate_bool(&code, self.get_iterations()).await?;
                let mut blk = CodeBlock::new(
                    Keyword::If,
                    code.indent,
                    code.file_position.unwrap_or_default(),
                    code.line_number,
                );
                blk.process_block = process;
                blk.expecting_else = self.active() && !process;
                self.stack.push(blk);
                self.last_conditional = None;
                Ok(None)
            }
            Keyword::ElseIf | Keyword::Else => {
                let Some((indent, expecting)) = self.last_conditional else {
                    return Err(self.flow_error(&code, "not preceded by a matching if"));
                };
                if indent != code.indent {
                    return Err(self.flow_error(&code, "indent does not match its if"));
                }
                let outer_active = self.active();
                let (process, expecting_else) = match keyword {
                    Keyword::ElseIf => {
                        let process = outer_active
                            && expecting
                            && self.evaluate_bool(&code, self.get_iterations()).await?;
                        (process, outer_active && expecting && !process)
                    }
                    _ => (outer_active && expecting, false),
                };
                let mut blk = CodeBlock::new(
                    keyword,
                    code.indent,
                    code.file_position.unwrap_or_default(),
                    code.line_number,
                );
                blk.process_block = process;
                blk.expecting_else = expecting_else;
                self.stack.push(blk);
                self.last_conditional = None;
                Ok(None)
            }
            Keyword::While => {
                let reentry = self
                    .stack
                    .last()
                    .map_or(false, |top| {
                        top.is_loop() && code.file_position == Some(top.start_position)
                    });
                if reentry {
                    let enclosing_active = self
                        .stack
                        .iter()
                        .take(self.stack.len() - 1)
                        .all(|b| b.process_block);
                    let iterations = self.stack.last().map(|top| top.iterations);
                    let process = enclosing_active
                        && self.evaluate_bool(&code, iterations).await?;
                    let top = self.stack.last_mut().expect("loop block present");
                    top.process_block = process;
                    top.continue_loop = false;
                    top.seen_codes = false;
                } else {
                    let process = self.active() && self.evaluate_bool(&code, Some(0)).await?;
                    let mut blk = CodeBlock::new(
                        Keyword::While,
                        code.indent,
                        code.file_position.unwrap_or_default(),
                        code.line_number,
                    );
                    blk.process_block = process;
                    self.stack.push(blk);
                }
                self.last_conditional = None;
                Ok(None)
            }
            Keyword::Break | Keyword::Continue => {
                self.last_conditional = None;
                if !self.active() {
                    return Ok(None);
                }
                let mut found = false;
                for block in self.stack.iter_mut().rev() {
                    block.process_block = false;
                    if block.is_loop() {
                        block.continue_loop = keyword == Keyword::Continue;
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(self.flow_error(&code, "not inside a while loop"));
                }
                Ok(None)
            }
            Keyword::Abort | Keyword::Return => {
                self.last_conditional = None;
                if !self.active() {
                    return Ok(None);
                }
                self.mark_seen();
                if let Some(argument) = code.keyword_argument.clone() {
                    let resolved = self.evaluate(&code, &argument, false).await?;
                    code.keyword_argument = Some(resolved);
                }
                // Delivered by the read loop once the channel drains.
                self.phase = Phase::AwaitingClose(Box::new(code));
                Ok(None)
            }
            Keyword::Var | Keyword::Global | Keyword::Set => {
                self.last_conditional = None;
                if !self.active() {
                    return Ok(None);
                }
                self.mark_seen();
                self.handle_assignment(&code, keyword).await?;
                Ok(None)
            }
            Keyword::Echo => {
                self.last_conditional = None;
                if !self.active() {
                    return Ok(None);
                }
                self.mark_seen();
                let argument = code.keyword_argument.clone().unwrap_or_default();
                let resolved = self.evaluate(&code, &argument, false).await?;
                code.keyword_argument = Some(resolved);
                Ok(Some(Read::Code(code)))
            }
        }
    }

    async fn handle_assignment(&mut self, code: &Code, keyword: Keyword) -> Result<()> {
        let argument = code.keyword_argument.as_deref().unwrap_or_default();
        let (name, expression) = argument
            .split_once('=')
            .ok_or_else(|| self.flow_error(code, "expected 'name = expression'"))?;
        let name = name.trim();
        let expression = expression.trim();
        if name.is_empty() || expression.is_empty() {
            return Err(self.flow_error(code, "expected 'name = expression'"));
        }

        let (qualified, create_new) = match keyword {
            Keyword::Var => (format!("var.{name}"), true),
            Keyword::Global => (format!("global.{name}"), true),
            // `set` targets an existing var.* or global.* name.
            _ => (name.to_string(), false),
        };
        if keyword == Keyword::Var {
            match self.stack.last_mut() {
                Some(top) => top.locals.push(qualified.clone()),
                None => self.file_locals.push(qualified.clone()),
            }
        }
        self.queues.push_action(HostAction::SetVariable {
            channel: self.channel,
            create_new,
            name: qualified,
            expression: expression.to_string(),
        });
        Ok(())
    }

    async fn resolve_parameters(&mut self, code: &mut Code) -> Result<()> {
        let iterations = self.get_iterations();
        for index in 0..code.parameters.len() {
            if !code.parameters[index].is_expression {
                continue;
            }
            let expression = code.parameters[index].value.clone();
            let context = EvalContext {
                code: &*code,
                iterations,
            };
            let resolved = self.evaluator.evaluate(context, &expression, false).await?;
            let parameter = &mut code.parameters[index];
            parameter.value = resolved;
            parameter.is_expression = false;
        }
        Ok(())
    }

    async fn evaluate_bool(&self, code: &Code, iterations: Option<u64>) -> Result<bool> {
        let expression = code.keyword_argument.clone().unwrap_or_default();
        let raw = self
            .evaluator
            .evaluate(EvalContext { code, iterations }, &expression, true)
            .await?;
        match raw.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(Error::Evaluation(format!(
                "expected boolean, got '{other}'"
            ))),
        }
    }

    async fn evaluate(&self, code: &Code, expression: &str, expect_bool: bool) -> Result<String> {
        self.evaluator
            .evaluate(
                EvalContext {
                    code,
                    iterations: self.get_iterations(),
                },
                expression,
                expect_bool,
            )
            .await
    }

    fn flow_error(&self, code: &Code, message: &str) -> Error {
        let what = match (code.code_type, code.keyword) {
            (CodeType::Keyword, Some(keyword)) => keyword.as_str(),
            _ => "code",
        };
        Error::code_parser(
            &self.display_name,
            code.line_number.unwrap_or(0),
            format!("'{what}': {message}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal evaluator: substitutes the loop counter and folds `a < b`
    /// integer comparisons. Everything else echoes back.
    struct StubEvaluator;

    #[async_trait]
    impl ExpressionEvaluator for StubEvaluator {
        async fn evaluate(
            &self,
            context: EvalContext<'_>,
            expression: &str,
            _expect_bool: bool,
        ) -> Result<String> {
            let expression = match context.iterations {
                Some(n) => expression.replace("iterations", &n.to_string()),
                None => expression.to_string(),
            };
            if let Some((lhs, rhs)) = expression.split_once('<') {
                let lhs: i64 = lhs.trim().parse().map_err(|_| {
                    Error::Evaluation(format!("bad operand '{}'", lhs.trim()))
                })?;
                let rhs: i64 = rhs.trim().parse().map_err(|_| {
                    Error::Evaluation(format!("bad operand '{}'", rhs.trim()))
                })?;
                return Ok((lhs < rhs).to_string());
            }
            Ok(expression.trim().to_string())
        }
    }

    async fn interpreter_for(content: &str) -> (tempfile::NamedTempFile, FileInterpreter, Arc<Queues>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let queues = Arc::new(Queues::new());
        let interpreter = FileInterpreter::open(
            file.path(),
            Channel::Trigger,
            true,
            queues.clone(),
            Arc::new(StubEvaluator),
        )
        .await
        .unwrap();
        (file, interpreter, queues)
    }

    async fn collect(interpreter: &mut FileInterpreter) -> Result<Vec<String>> {
        let mut out = Vec::new();
        loop {
            match interpreter.read_code().await? {
                Read::Code(code) => out.push(code.to_string()),
                // With nothing queued, the channel is always idle.
                Read::NotReady => continue,
                Read::Eof => return Ok(out),
            }
        }
    }

    #[tokio::test]
    async fn while_loop_runs_three_times() {
        let (_f, mut interpreter, _q) =
            interpreter_for("while iterations < 3\n  G1 X{iterations}\nM400\n").await;
        let codes = collect(&mut interpreter).await.unwrap();
        assert_eq!(codes, vec!["G1 X0", "G1 X1", "G1 X2", "M400"]);
    }

    #[tokio::test]
    async fn elif_chain_takes_first_true_branch() {
        let source = "if 1 < 0\n  G1 X1\nelif 1 < 2\n  G1 X2\nelse\n  G1 X3\nM400\n";
        let (_f, mut interpreter, _q) = interpreter_for(source).await;
        let codes = collect(&mut interpreter).await.unwrap();
        assert_eq!(codes, vec!["G1 X2", "M400"]);
    }

    #[tokio::test]
    async fn else_after_taken_branch_is_skipped() {
        let source = "if 0 < 1\n  G1 X1\nelse\n  G1 X2\n";
        let (_f, mut interpreter, _q) = interpreter_for(source).await;
        let codes = collect(&mut interpreter).await.unwrap();
        assert_eq!(codes, vec!["G1 X1"]);
    }

    #[tokio::test]
    async fn continue_skips_rest_of_pass() {
        let source = "while iterations < 4\n  if iterations < 2\n    continue\n  G1 X{iterations}\nM400\n";
        let (_f, mut interpreter, _q) = interpreter_for(source).await;
        let codes = collect(&mut interpreter).await.unwrap();
        assert_eq!(codes, vec!["G1 X2", "G1 X3", "M400"]);
    }

    #[tokio::test]
    async fn break_leaves_the_loop() {
        let source = "while iterations < 10\n  G1 X{iterations}\n  break\nM400\n";
        let (_f, mut interpreter, _q) = interpreter_for(source).await;
        let codes = collect(&mut interpreter).await.unwrap();
        assert_eq!(codes, vec!["G1 X0", "M400"]);
    }

    #[tokio::test]
    async fn empty_while_body_is_a_parse_error() {
        let (_f, mut interpreter, _q) = interpreter_for("while 0 < 1\nM400\n").await;
        let result = collect(&mut interpreter).await;
        assert!(matches!(result, Err(Error::CodeParser { .. })));
    }

    #[tokio::test]
    async fn elif_without_if_is_an_error() {
        let (_f, mut interpreter, _q) = interpreter_for("G28\nelif 1 < 2\n").await;
        let result = collect(&mut interpreter).await;
        assert!(matches!(result, Err(Error::CodeParser { .. })));
    }

    #[tokio::test]
    async fn break_outside_loop_is_an_error() {
        let (_f, mut interpreter, _q) = interpreter_for("break\n").await;
        let result = collect(&mut interpreter).await;
        assert!(matches!(result, Err(Error::CodeParser { .. })));
    }

    #[tokio::test]
    async fn abort_closes_the_file_and_returns_the_code() {
        let (_f, mut interpreter, _q) = interpreter_for("G28\nabort oops\nG1 X1\n").await;
        let mut codes = Vec::new();
        loop {
            match interpreter.read_code().await.unwrap() {
                Read::Code(code) => codes.push(code),
                Read::NotReady => continue,
                Read::Eof => break,
            }
        }
        assert_eq!(codes.len(), 2);
        assert!(codes[1].is_keyword(Keyword::Abort));
        assert_eq!(codes[1].keyword_argument.as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn var_and_set_queue_variable_actions() {
        let source = "var foo = 1\nset var.foo = 2\nG1 X1\n";
        let (_f, mut interpreter, queues) = interpreter_for(source).await;
        let codes = collect(&mut interpreter).await.unwrap();
        assert_eq!(codes, vec!["G1 X1"]);

        match queues.pop_action() {
            Some(HostAction::SetVariable {
                create_new, name, ..
            }) => {
                assert!(create_new);
                assert_eq!(name, "var.foo");
            }
            other => panic!("unexpected action {other:?}"),
        }
        match queues.pop_action() {
            Some(HostAction::SetVariable {
                create_new, name, ..
            }) => {
                assert!(!create_new);
                assert_eq!(name, "var.foo");
            }
            other => panic!("unexpected action {other:?}"),
        }
        // File close drops the file-scoped local.
        match queues.pop_action() {
            Some(HostAction::DeleteLocal { name, .. }) => assert_eq!(name, "var.foo"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn echo_is_returned_with_resolved_argument() {
        let (_f, mut interpreter, _q) = interpreter_for("echo 1 < 2\n").await;
        match interpreter.read_code().await.unwrap() {
            Read::Code(code) => {
                assert!(code.is_keyword(Keyword::Echo));
                assert_eq!(code.keyword_argument.as_deref(), Some("true"));
            }
            other => panic!("unexpected read {other:?}"),
        }
    }

    #[tokio::test]
    async fn iterations_counter_is_scoped_to_the_loop() {
        let (_f, mut interpreter, _q) =
            interpreter_for("while iterations < 2\n  G1 X{iterations}\n").await;
        assert_eq!(interpreter.get_iterations(), None);
        loop {
            match interpreter.read_code().await.unwrap() {
                Read::Code(_) => {
                    assert!(interpreter.get_iterations().is_some());
                }
                Read::NotReady => continue,
                Read::Eof => break,
            }
        }
        assert_eq!(interpreter.get_iterations(), None);
    }

    #[tokio::test]
    async fn set_position_resets_line_tracking() {
        let (_f, mut interpreter, _q) = interpreter_for("G28\nG29\n").await;
        interpreter.read_code().await.unwrap();
        interpreter.set_position(4).await.unwrap();
        assert_eq!(interpreter.line_number(), None);
        interpreter.set_position(0).await.unwrap();
        assert_eq!(interpreter.line_number(), Some(1));
    }
}
