//! Command lines of re-executed children.

/// Options only meaningful in the parent process.
const PARENT_ONLY: &[&str] = &["ansi", "no-progress", "pm-proc-id"];

/// Flag selecting the work item of a child.
pub const PROC_ID: &str = "pm-proc-id";

/// Resolved value of a long option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Count(u64),
    Value(String),
}

/// Everything needed to build the command line of any child.
#[derive(Clone, Debug)]
pub struct ChildTemplate {
    program: String,
    options: Vec<(String, OptionValue)>,
    positional: Vec<String>,
}

/// One child command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub work_item: String,
    pub program: String,
    pub args: Vec<String>,
}

impl ChildTemplate {
    /// Creates a template running `program` with the parent's `options` and
    /// `positional` arguments.
    ///
    /// Unset options and parent-only options are dropped.
    pub fn new<I>(program: &str, options: I, positional: &[String]) -> Self
    where
        I: IntoIterator<Item = (String, OptionValue)>,
    {
        let options = options
            .into_iter()
            .filter(|(name, value)| {
                !PARENT_ONLY.contains(&name.as_str())
                    && match value {
                        OptionValue::Flag(set) => *set,
                        OptionValue::Count(n) => *n > 0,
                        OptionValue::Value(v) => !v.is_empty(),
                    }
            })
            .collect();
        Self {
            program: program.to_owned(),
            options,
            positional: positional.to_vec(),
        }
    }

    /// Builds the invocation running only `work_item`.
    pub fn invocation(&self, work_item: &str) -> Invocation {
        let mut args = Vec::new();
        for (name, value) in &self.options {
            match value {
                OptionValue::Flag(_) => args.push(format!("--{}", name)),
                OptionValue::Count(n) => {
                    for _ in 0..*n {
                        args.push(format!("--{}", name));
                    }
                }
                OptionValue::Value(v) => args.push(format!("--{}={}", name, v)),
            }
        }
        args.push(format!("--{}={}", PROC_ID, work_item));
        // Positional arguments may start with a dash.
        args.push("--".to_owned());
        args.extend(self.positional.iter().cloned());
        Invocation {
            work_item: work_item.to_owned(),
            program: self.program.clone(),
            args,
        }
    }
}

impl Invocation {
    /// Shell-quoted command line, suitable for reproducing this child by hand.
    pub fn command_line(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(&self.args))
    }
}
