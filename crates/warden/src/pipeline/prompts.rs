//! Prompt text for each stage and parsing of the replies.

use super::machine::Revision;

pub(crate) const PLANNER_SYSTEM: &str =
    "You are a task planner. Break down the user's request into a list of specific tasks.";

pub(crate) const CODER_SYSTEM: &str = "You are a JavaScript programmer. Write code to \
     accomplish the given tasks using the provided file system and permission system APIs.";

pub(crate) const REVIEWER_SYSTEM: &str = "You are a code reviewer. Analyze the given \
     JavaScript code for correctness, security, and adherence to best practices.";

pub(crate) const RECOVERY_SYSTEM: &str = "You are an AI assistant specialized in debugging \
     JavaScript code for file system operations. Your task is to analyze the error and \
     suggest a fix.";

const APPROVED: &str = "APPROVED";

pub(crate) fn plan(input: &str) -> String {
    format!("User request: {input}\n\nBreak this request down into a list of specific tasks:")
}

/// Non-empty lines of the planner's reply.
pub(crate) fn parse_tasks(reply: &str) -> Vec<String> {
    reply
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn write_code(tasks: &[String], revision: Option<&Revision>) -> String {
    let mut prompt = format!("Tasks:\n{}\n\n", tasks.join("\n"));
    if let Some(Revision { code, feedback }) = revision {
        prompt.push_str(&format!(
            "A previous attempt was rejected in review.\n\nPrevious code:\n{code}\n\n\
             Review feedback:\n{feedback}\n\n"
        ));
    }
    prompt.push_str("Write JavaScript code to accomplish these tasks:");
    prompt
}

pub(crate) fn review(code: &str) -> String {
    format!(
        "Review the following code:\n\n{code}\n\nIs this code correct, secure, and following \
         best practices? Respond with 'APPROVED' if it's good, or explain the issues if not."
    )
}

/// Approval is the bare token, case-insensitive, surrounding whitespace
/// ignored.
pub(crate) fn is_approved(reply: &str) -> bool {
    reply.trim().to_uppercase() == APPROVED
}

pub(crate) fn recover(error: &str) -> String {
    format!(
        "The following code resulted in an error:\n{error}\n\nPlease suggest a fix for this \
         error, considering the context of file system operations and permission checks."
    )
}

/// Strip one surrounding Markdown code fence, if present.
pub(crate) fn strip_code_fence(reply: &str) -> String {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (`js`, `javascript`, ...).
    let Some((_, body)) = rest.split_once('\n') else {
        return trimmed.to_string();
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}
