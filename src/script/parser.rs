//! Parsing of existing sbatch scripts back into job descriptions
//!
//! The run command is located with a regex compiled from the same template
//! that produced it. Everything the assembler emits around it (shebang,
//! directive lines, `*_param` declarations, the task-id binding and the
//! loop) is recognised as boilerplate, so the remaining lines are exactly the
//! user's setup and post commands.

use log::{debug, trace, warn};
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::assembler::{
    ARRAY_TASK_ENV, DIRECTIVE_MARKER, LOOP_CLOSE, LOOP_OPEN, TASK_ID_VAR,
};
use super::job_spec::JobSpecBuilder;
use super::template::{Placeholder, RunTemplate, Segment};
use crate::errors::{Result, ScriptError};
use crate::params::{FlatParams, GridMode, GridSearch, OrderedMap, ParamValue, unflatten};

/// A script parsed back into its parts
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ParsedScript {
    /// `#SBATCH` directives in script order
    pub directives: OrderedMap<ParamValue>,
    /// Script name captured from the run command, if the template has one
    pub script_name: Option<String>,
    /// The run command line as written
    pub run_command: String,
    /// Parameters; grid-searched paths hold their per-task lists
    pub params: FlatParams,
    /// Paths whose values were resolved from array declarations
    pub grid_paths: Vec<String>,
    /// Values captured for non-builtin template placeholders
    pub run_args: OrderedMap<String>,
    /// Lines before the run command that are not boilerplate
    pub commands: Vec<String>,
    /// Lines after the run command that are not boilerplate
    pub post_commands: Vec<String>,
    /// Literal task id bound in a single-task script
    pub task_id: Option<usize>,
    /// Number of tasks of a sequential loop
    pub loop_tasks: Option<usize>,
}

impl ParsedScript {
    /// Rebuild a job specification from the parsed script.
    ///
    /// Grid-searched paths already hold one value per task, so they are
    /// combined element-wise rather than expanded again.
    pub fn into_builder(self, template: RunTemplate) -> JobSpecBuilder {
        let mut builder = JobSpecBuilder::new()
            .directives(self.directives)
            .params(unflatten(&self.params))
            .commands(self.commands)
            .post_commands(self.post_commands)
            .run_command(template);
        if !self.grid_paths.is_empty() {
            let grid = GridSearch::new(self.grid_paths, vec![]).with_mode(GridMode::Zip);
            builder = builder.grid_search(grid);
        }
        if let Some(name) = self.script_name {
            builder = builder.script_name(name);
        }
        for (key, value) in self.run_args {
            builder = builder.run_arg(key, value);
        }
        builder
    }
}

/// Parses scripts whose run command was rendered from a known template
pub struct ScriptParser {
    pattern: Regex,
    slots: Vec<Placeholder>,
    array_declaration: Regex,
    scalar_declaration: Regex,
    loop_header: Regex,
    variable_reference: Regex,
}

enum Declaration {
    Array(Vec<ParamValue>),
    Scalar(ParamValue),
}

impl ScriptParser {
    pub fn new(template: &RunTemplate) -> Result<Self> {
        let mut pattern = String::from("^");
        let mut slots = Vec::new();
        for segment in template.segments() {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Slot(placeholder) => {
                    let group = match placeholder {
                        Placeholder::ScriptName | Placeholder::NumGpus => r"(\S*?)",
                        Placeholder::Extra(_) => r"(.*?)",
                        _ => r"(.*)",
                    };
                    pattern.push_str(group);
                    slots.push(placeholder.clone());
                }
            }
        }
        pattern.push('$');
        trace!("Run command pattern: {}", pattern);

        let pattern = Regex::new(&pattern).map_err(|e| {
            ScriptError::template(format!(
                "cannot build a matching pattern for '{}': {}",
                template, e
            ))
        })?;
        Ok(Self {
            pattern,
            slots,
            array_declaration: compile(r"^([A-Za-z0-9_]*_param)=\((.*)\)$")?,
            scalar_declaration: compile(r"^([A-Za-z0-9_]*_param)=(.*)$")?,
            loop_header: compile(r"^for taskId in \$\(seq 0 (\d+)\)$")?,
            variable_reference: compile(r"^\$\{([A-Za-z0-9_]+)(\[\$taskId\])?\}$")?,
        })
    }

    pub fn parse(&self, script: &str) -> Result<ParsedScript> {
        let lines: Vec<&str> = script
            .trim_matches('\n')
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .collect();

        let mut parsed = ParsedScript::default();
        let mut run_index = None;
        for (index, line) in lines.iter().map(|line| line.trim_start()).enumerate() {
            if line.starts_with(DIRECTIVE_MARKER) {
                let (key, value) = parse_directive(line);
                parsed.directives.insert(key, value);
            } else if run_index.is_none() && !line.starts_with('#') && self.pattern.is_match(line)
            {
                run_index = Some(index);
            }
        }
        let Some(run_index) = run_index else {
            return Err(ScriptError::parse(
                "no line matches the run command; cannot locate the job parameters",
            ));
        };

        let run_line = lines[run_index].trim_start();
        parsed.run_command = run_line.to_string();
        let tokens = self.capture_tokens(run_line, &mut parsed);

        let declarations = self.collect_declarations(&lines[..run_index]);
        let mut referenced: HashSet<String> = HashSet::new();
        for token in tokens {
            let Some((key, raw)) = token.split_once('=') else {
                warn!("Ignoring run command token without '=': {}", token);
                continue;
            };
            match self.resolve_reference(raw, &declarations) {
                Some((variable, Declaration::Array(values))) => {
                    referenced.insert(variable);
                    parsed.params.insert(key, ParamValue::List(values.clone()));
                    parsed.grid_paths.push(key.to_string());
                }
                Some((variable, Declaration::Scalar(value))) => {
                    referenced.insert(variable);
                    parsed.params.insert(key, value.clone());
                }
                None => {
                    parsed.params.insert(key, ParamValue::decode_literal(raw));
                }
            }
        }

        let pinned = declarations.iter().any(|(name, declaration)| {
            referenced.contains(name) && matches!(declaration, Declaration::Scalar(_))
        });
        self.split_commands(&lines, run_index, &referenced, pinned, &mut parsed);

        debug!(
            "Parsed script for {:?}: {} directive(s), {} parameter(s), {} command(s)",
            parsed.script_name,
            parsed.directives.len(),
            parsed.params.len(),
            parsed.commands.len() + parsed.post_commands.len()
        );
        Ok(parsed)
    }

    /// Record the named captures and return the parameter tokens
    fn capture_tokens(&self, run_line: &str, parsed: &mut ParsedScript) -> Vec<String> {
        let mut param_text: Vec<&str> = Vec::new();
        if let Some(captures) = self.pattern.captures(run_line) {
            for (slot, capture) in self.slots.iter().zip(captures.iter().skip(1)) {
                let text = capture.map(|m| m.as_str()).unwrap_or_default();
                match slot {
                    Placeholder::ScriptName if parsed.script_name.is_none() => {
                        parsed.script_name = Some(text.to_string());
                    }
                    Placeholder::Extra(name) => {
                        parsed.run_args.insert(name.clone(), text.to_string());
                    }
                    slot if slot.carries_params() => param_text.push(text),
                    _ => {}
                }
            }
        }
        // Adjacent greedy groups may split a token; rejoining restores it
        split_tokens(&param_text.join(" "))
            .into_iter()
            .map(|token| unescape(unquote(&token)))
            .collect()
    }

    fn split_commands(
        &self,
        lines: &[&str],
        run_index: usize,
        referenced: &HashSet<String>,
        pinned: bool,
        parsed: &mut ParsedScript,
    ) {
        let mut in_loop = false;
        for (index, raw) in lines[..run_index].iter().enumerate() {
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with(DIRECTIVE_MARKER) {
                continue;
            }
            if index == 0 && line.starts_with("#!") {
                continue;
            }
            if let Some(value) = line.strip_prefix(&format!("{}=", TASK_ID_VAR)) {
                if value != ARRAY_TASK_ENV
                    && pinned
                    && let Ok(task_id) = value.parse::<usize>()
                {
                    parsed.task_id = Some(task_id);
                }
                continue;
            }
            if let Some(captures) = self.loop_header.captures(line) {
                let last: usize = captures[1].parse().unwrap_or_default();
                parsed.loop_tasks = Some(last + 1);
                in_loop = true;
                continue;
            }
            if in_loop && line == LOOP_OPEN {
                continue;
            }
            if let Some(captures) = self.scalar_declaration.captures(line)
                && referenced.contains(&captures[1])
            {
                continue;
            }
            parsed.commands.push(raw.to_string());
        }

        let mut loop_closed = !in_loop;
        for raw in &lines[run_index + 1..] {
            let line = raw.trim_start();
            if line.starts_with(DIRECTIVE_MARKER) {
                continue;
            }
            if line.is_empty() && !loop_closed {
                continue;
            }
            if !loop_closed && line == LOOP_CLOSE {
                loop_closed = true;
                continue;
            }
            parsed.post_commands.push(raw.to_string());
        }
    }

    fn collect_declarations(&self, lines: &[&str]) -> HashMap<String, Declaration> {
        let mut declarations = HashMap::new();
        for line in lines {
            if let Some(captures) = self.array_declaration.captures(line.trim_start()) {
                let values = split_tokens(&captures[2])
                    .iter()
                    .map(|token| ParamValue::decode_literal(&unescape(unquote(token))))
                    .collect();
                declarations.insert(captures[1].to_string(), Declaration::Array(values));
            } else if let Some(captures) = self.scalar_declaration.captures(line.trim_start()) {
                let value = ParamValue::decode_literal(&unescape(&captures[2]));
                declarations.insert(captures[1].to_string(), Declaration::Scalar(value));
            }
        }
        declarations
    }

    fn resolve_reference<'a>(
        &self,
        raw: &str,
        declarations: &'a HashMap<String, Declaration>,
    ) -> Option<(String, &'a Declaration)> {
        let captures = self.variable_reference.captures(raw)?;
        let variable = captures[1].to_string();
        let declaration = declarations.get(&variable)?;
        Some((variable, declaration))
    }
}

/// Split a directive line at the first `=` or whitespace after the option name
fn parse_directive(line: &str) -> (String, ParamValue) {
    let body = line[DIRECTIVE_MARKER.len()..].trim();
    let (key, value) = match body.find(|c: char| c == '=' || c.is_whitespace()) {
        Some(at) => {
            let (key, rest) = body.split_at(at);
            let mut rest = rest.chars();
            rest.next();
            (key, rest.as_str())
        }
        None => (body, ""),
    };
    (key.to_string(), ParamValue::decode_literal(value.trim()))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| ScriptError::parse(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Split on whitespace outside double quotes; escapes are kept verbatim
fn split_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(token: &str) -> &str {
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

fn unescape(text: &str) -> String {
    text.replace("\\\"", "\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(template: &str) -> ScriptParser {
        ScriptParser::new(&RunTemplate::parse(template).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_handwritten_script() {
        let script = "#!/bin/bash\n\
                      #SBATCH --job-name=job-name\n\
                      #SBATCH --time=01:00:00\n\
                      #SBATCH -o job-name.out\n\
                      #SBATCH --error=job-name.err\n\
                      \n\
                      python main.py \"script_param=7\" another_param=\"a\"";
        let parsed = parser("python {script_name} {all_params}").parse(script).unwrap();

        assert_eq!(
            parsed.directives.get("--job-name"),
            Some(&ParamValue::from("job-name"))
        );
        assert_eq!(
            parsed.directives.get("--time"),
            Some(&ParamValue::from("01:00:00"))
        );
        assert_eq!(
            parsed.directives.get("-o"),
            Some(&ParamValue::from("job-name.out"))
        );
        assert_eq!(
            parsed.directives.get("--error"),
            Some(&ParamValue::from("job-name.err"))
        );
        assert_eq!(
            parsed.run_command,
            "python main.py \"script_param=7\" another_param=\"a\""
        );
        assert_eq!(parsed.script_name.as_deref(), Some("main.py"));
        assert_eq!(parsed.params.get("script_param"), Some(&ParamValue::Int(7)));
        assert_eq!(
            parsed.params.get("another_param"),
            Some(&ParamValue::from("a"))
        );
        assert!(parsed.commands.is_empty());
    }

    #[test]
    fn test_no_run_command() {
        let result = parser("python {script_name} {all_params}").parse("#!/bin/sh\necho hi");
        assert!(matches!(result, Err(ScriptError::Parse(_))));
    }

    #[test]
    fn test_commands_around_run_line() {
        let script = "#!/bin/sh\n#SBATCH -N 1\n\nmodule load cuda\ncd /work\ntaskId=0\n\
                      srun python main.py \"x=1\"\necho done-with-run\nrm -rf /tmp/x";
        let parsed = parser("srun python {script_name} {params}").parse(script).unwrap();
        assert_eq!(parsed.commands, vec!["module load cuda", "cd /work"]);
        assert_eq!(parsed.post_commands, vec!["echo done-with-run", "rm -rf /tmp/x"]);
        assert_eq!(parsed.directives.get("-N"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn test_loop_declarations_are_resolved() {
        let script = "#!/bin/sh\n#SBATCH -J sweep\n\n\
                      lr_param=(\"0.1\" \"0.01\")\n\
                      for taskId in $(seq 0 1)\n\
                      do\n\
                      python main.py \"seed=3\" \"lr=${lr_param[$taskId]}\"\n\
                      done\n\
                      echo finished";
        let parsed = parser("python {script_name} {all_params}").parse(script).unwrap();
        assert_eq!(
            parsed.params.get("lr"),
            Some(&ParamValue::List(vec![ParamValue::Float(0.1), ParamValue::Float(0.01)]))
        );
        assert_eq!(parsed.grid_paths, vec!["lr"]);
        assert_eq!(parsed.loop_tasks, Some(2));
        assert!(parsed.commands.is_empty());
        assert_eq!(parsed.post_commands, vec!["echo finished"]);
    }

    #[test]
    fn test_pinned_declaration() {
        let script = "#!/bin/sh\n\nlr_param=0.01\ntaskId=1\npython main.py \"lr=${lr_param}\"";
        let parsed = parser("python {script_name} {all_params}").parse(script).unwrap();
        assert_eq!(parsed.params.get("lr"), Some(&ParamValue::Float(0.01)));
        assert!(parsed.grid_paths.is_empty());
        assert_eq!(parsed.task_id, Some(1));
    }

    #[test]
    fn test_unreferenced_declaration_is_a_command() {
        let script = "#!/bin/sh\n\nmy_param=5\ntaskId=0\npython main.py \"x=1\"";
        let parsed = parser("python {script_name} {all_params}").parse(script).unwrap();
        assert_eq!(parsed.commands, vec!["my_param=5"]);
        assert_eq!(parsed.task_id, None);
    }

    #[test]
    fn test_extra_placeholders_are_captured() {
        let script = "python main.py \"x=1\" --ckpt /scratch/ckpt";
        let parsed = parser("python {script_name} {params} --ckpt {checkpoint_dir}")
            .parse(script)
            .unwrap();
        assert_eq!(
            parsed.run_args.get("checkpoint_dir").map(String::as_str),
            Some("/scratch/ckpt")
        );
        assert_eq!(parsed.params.get("x"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn test_quoted_tokens_keep_spaces() {
        let script = "python main.py \"msg=hello world\" \"quote=say \\\"hi\\\"\" \"xs=[1,2]\"";
        let parsed = parser("python {script_name} {all_params}").parse(script).unwrap();
        assert_eq!(parsed.params.get("msg"), Some(&ParamValue::from("hello world")));
        assert_eq!(parsed.params.get("quote"), Some(&ParamValue::from("say \"hi\"")));
        assert_eq!(
            parsed.params.get("xs"),
            Some(&ParamValue::List(vec![ParamValue::Int(1), ParamValue::Int(2)]))
        );
    }

    #[test]
    fn test_template_literals_are_escaped() {
        let script = "python3 -u main.py (x) \"a=1\"";
        let parsed = parser("python3 -u {script_name} (x) {params}").parse(script).unwrap();
        assert_eq!(parsed.script_name.as_deref(), Some("main.py"));
        assert_eq!(parsed.params.get("a"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn test_split_tokens() {
        assert_eq!(
            split_tokens("\"a=1\"  b=\"x y\" \"c=\\\"q r\\\"\""),
            vec!["\"a=1\"", "b=\"x y\"", "\"c=\\\"q r\\\"\""]
        );
    }
}
