//! Code preparation and execution.
//!
//! Submitted code is written to a per-job file and run by the
//! configured interpreter with stdout/stderr redirected to per-job
//! capture files. A failed run appends the error plus a numbered
//! listing of the code to the stderr capture, so `/wait` and
//! `/stderr` can show the caller exactly what blew up.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use crate::registry::ExeConfig;

/// Strip a leading `begin` / trailing matching `end` wrapper.
///
/// Callers that capture a block expression submit it wrapped; the
/// wrapper is not part of the code to run. Anything else passes
/// through byte-for-byte.
pub fn strip_begin_end(code: &str) -> String {
    let lines: Vec<&str> = code.lines().collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let Some(first) = first else {
        return code.to_string();
    };
    if lines[first].trim() != "begin" {
        return code.to_string();
    }
    let last = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .expect("a non-empty first line implies a non-empty last line");
    if last <= first || lines[last].trim() != "end" {
        return code.to_string();
    }
    lines[first + 1..last].join("\n")
}

/// The code with 1-based line numbers, as shown in failure reports.
pub fn numbered_listing(code: &str) -> String {
    code.lines()
        .enumerate()
        .map(|(i, line)| format!("{:>4} | {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run the interpreter on `code_path`, capturing output to the given
/// files. Returns the failure message on a non-zero exit or a spawn
/// error, after appending it (with the listing) to the stderr capture.
pub(crate) async fn execute(
    exe: &ExeConfig,
    code: &str,
    code_path: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<(), String> {
    let capture = |path: &Path| {
        std::fs::File::create(path).map_err(|e| format!("cannot create {}: {e}", path.display()))
    };
    let stdout = capture(stdout_path)?;
    let stderr = capture(stderr_path)?;

    let mut command = tokio::process::Command::new(&exe.exename);
    command
        .args(&exe.exeflags)
        .arg(code_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    let failure = match command.status().await {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => format!("job exited with {status}"),
        Err(e) => format!("failed to spawn {}: {e}", exe.exename),
    };

    append_failure(stderr_path, &failure, code);
    Err(failure)
}

fn append_failure(stderr_path: &Path, message: &str, code: &str) {
    let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(stderr_path) else {
        return;
    };
    let _ = writeln!(file, "\n{message}\nwhile running:\n{}", numbered_listing(code));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_code_passes_through() {
        let code = "x = 1\ny = 2";
        assert_eq!(strip_begin_end(code), code);
    }

    #[test]
    fn begin_end_wrapper_is_stripped() {
        let code = "begin\nx = 1\ny = 2\nend";
        assert_eq!(strip_begin_end(code), "x = 1\ny = 2");
    }

    #[test]
    fn leading_blank_lines_are_tolerated() {
        let code = "\n\nbegin\nx = 1\nend\n";
        assert_eq!(strip_begin_end(code), "x = 1");
    }

    #[test]
    fn begin_without_end_is_untouched() {
        let code = "begin\nx = 1";
        assert_eq!(strip_begin_end(code), code);
    }

    #[test]
    fn nested_content_keeps_inner_lines() {
        let code = "begin\nfor i in 1:3\n    f(i)\nend\nend";
        assert_eq!(strip_begin_end(code), "for i in 1:3\n    f(i)\nend");
    }

    #[test]
    fn listing_is_one_indexed() {
        let listing = numbered_listing("a\nb");
        assert_eq!(listing, "   1 | a\n   2 | b");
    }
}
