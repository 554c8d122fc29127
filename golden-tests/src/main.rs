use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;

static EXPECTED_SUMMARY_FILE: &str = "expected-summary";
/// When set, missing or outdated summaries are recorded instead of failing the run
static BLESS_VAR: &str = "GOLDEN_BLESS";

struct TestCase {
    dir: PathBuf,
    name: String,
    args: String,
    expected_summary: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let bless = std::env::var_os(BLESS_VAR).is_some();

    let mut test_cases = Vec::new();
    let test_dirs =
        std::fs::read_dir("golden-tests/tests").context("golden tests root directory not found")?;
    for entry in test_dirs {
        let path = entry?.path();
        if !path.is_dir() {
            println!("skipping `{}`: not a directory", path.display());
            continue;
        }

        let args_path = path.join("args");
        let args = std::fs::read_to_string(&args_path)
            .with_context(|| format!("no `args` file found at `{}`", args_path.display()))?;

        let summary_path = path.join(EXPECTED_SUMMARY_FILE);
        let expected_summary = summary_path
            .is_file()
            .then(|| std::fs::read_to_string(&summary_path))
            .transpose()
            .with_context(|| format!("failed to read `{}`", summary_path.display()))?;

        test_cases.push(TestCase {
            name: path.display().to_string(),
            dir: path,
            args,
            expected_summary,
        });
    }
    test_cases.sort_by(|a, b| a.name.cmp(&b.name));

    let mut errored = false;
    for test_case in test_cases {
        let name = test_case.name.clone();
        match run_lab(test_case, bless) {
            Ok(()) => println!("{name}: ✅"),
            Err(e) => {
                errored = true;
                println!("Error running golden test `{name}`");
                match e {
                    TestError::Internal(e) => println!("{e:?}"),
                    TestError::MissingSummary(summary) => println!(
                        "No `{EXPECTED_SUMMARY_FILE}` recorded yet, rerun with {BLESS_VAR}=1 to \
                         accept this one:\n{summary}"
                    ),
                    TestError::Compare(e) => {
                        if let Some(diff) = e.summary_diff {
                            println!("Expected summary differs from the actual run:\n{diff}");
                        }
                        for violation in e.violations {
                            println!("Command log: {violation}");
                        }
                    }
                }
            }
        }
    }

    if errored {
        bail!("one or more golden tests failed");
    }

    Ok(())
}

enum TestError {
    Internal(anyhow::Error),
    MissingSummary(String),
    Compare(CompareError),
}

struct CompareError {
    summary_diff: Option<String>,
    violations: Vec<String>,
}

/// The fields of netlab's command log this runner looks at
#[derive(Deserialize)]
struct CommandRecord {
    sequence: u64,
    node: String,
    command: String,
    status: Option<i32>,
    at_ms: u64,
}

fn run_lab(test_case: TestCase, bless: bool) -> Result<(), TestError> {
    let case = test_case
        .dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let log_path = std::env::temp_dir().join(format!("netlab-golden-{case}.json"));

    let output = Command::new("cargo")
        .arg("run")
        .arg("--release")
        .arg("--bin")
        .arg("netlab")
        .arg("--")
        .args(test_case.args.split_whitespace())
        .arg("--command-log")
        .arg(&log_path)
        .output()
        .context("failed to launch netlab")
        .map_err(TestError::Internal)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let log = read_command_log(&log_path)
        .with_context(|| String::from_utf8_lossy(&output.stderr).into_owned())
        .map_err(TestError::Internal)?;

    let summary = summarize(&stdout);
    let violations = check_command_log(&log);

    let summary_diff = match test_case.expected_summary {
        Some(expected) if expected == summary => None,
        _ if bless => {
            std::fs::write(test_case.dir.join(EXPECTED_SUMMARY_FILE), &summary)
                .context("failed to record the summary")
                .map_err(TestError::Internal)?;
            None
        }
        Some(expected) => Some(diff::render(&expected, &summary)),
        None => return Err(TestError::MissingSummary(summary)),
    };

    if summary_diff.is_some() || !violations.is_empty() {
        Err(TestError::Compare(CompareError {
            summary_diff,
            violations,
        }))
    } else {
        Ok(())
    }
}

fn read_command_log(path: &Path) -> anyhow::Result<Vec<CommandRecord>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("netlab wrote no command log to `{}`", path.display()))?;
    serde_json::from_str(&json).context("malformed command log")
}

/// Reduces netlab's report to what must not change from one run to the next: the elected root,
/// the shape of the tree, the installed rules and the verdicts. Timings, attempt counts and
/// command totals are left out.
fn summarize(stdout: &str) -> String {
    let count = |links: &str| links.split(',').filter(|l| !l.trim().is_empty()).count();

    let mut summary = Vec::new();
    let mut section = "";
    for line in stdout.lines() {
        if let Some(title) = line.strip_prefix("--- ").and_then(|l| l.strip_suffix(" ---")) {
            section = title;
            continue;
        }
        // Nested items (attempt results, error details) start with whitespace
        let Some(item) = line.strip_prefix("* ") else {
            continue;
        };

        match section {
            "Convergence" => {
                if let Some(rest) = item.strip_prefix("Root bridge ") {
                    let root = rest.split_whitespace().next().unwrap_or("-");
                    summary.push(format!("convergence: root {root}"));
                } else if let Some(links) = item.strip_prefix("Forwarding:") {
                    summary.push(format!("forwarding links: {}", count(links)));
                } else if let Some(links) = item.strip_prefix("Blocked:") {
                    summary.push(format!("blocked links: {}", count(links)));
                } else if item.starts_with("WARNING") {
                    summary.push("convergence: timed out".to_string());
                } else {
                    summary.push(format!("convergence: {item}"));
                }
            }
            "Installed rules" => summary.push(format!("rule: {item}")),
            "Tests" => {
                let verdict = item.rsplit_once(" after ").map_or(item, |(head, _)| head);
                summary.push(format!("scenario {verdict}"));
            }
            "Summary" if !item.ends_with("commands executed") => summary.push(item.to_string()),
            _ => {}
        }
    }

    let mut summary = summary.join("\n");
    summary.push('\n');
    summary
}

/// Ordering guarantees every run must keep, whatever the lab
fn check_command_log(log: &[CommandRecord]) -> Vec<String> {
    let mut violations = Vec::new();

    for (index, record) in log.iter().enumerate() {
        if record.sequence != index as u64 {
            violations.push(format!(
                "entry {index} carries sequence number {}",
                record.sequence
            ));
        }
        if record.status.is_none() {
            violations.push(format!(
                "`{}` could not be spawned on {}",
                record.command, record.node
            ));
        }
    }
    if log.windows(2).any(|w| w[1].at_ms < w[0].at_ms) {
        violations.push("timestamps go backwards".to_string());
    }

    for (position, enable) in log.iter().enumerate() {
        if !enable.command.contains("stp_enable=true") {
            continue;
        }
        let prioritized = log[..position]
            .iter()
            .any(|r| r.node == enable.node && r.command.contains("stp-priority="));
        if !prioritized {
            violations.push(format!(
                "{} enabled spanning tree before getting its priority",
                enable.node
            ));
        }
    }

    let mut gateways: Vec<&str> = Vec::new();
    for record in log {
        if record.command.ends_with("ip_forward=1") && !gateways.contains(&record.node.as_str()) {
            gateways.push(&record.node);
        }
    }
    for gateway in gateways {
        let commands: Vec<&str> = log
            .iter()
            .filter(|r| r.node == gateway)
            .map(|r| r.command.as_str())
            .collect();

        let enabled = commands.iter().position(|c| c.ends_with("ip_forward=1"));
        let first_rule = commands
            .iter()
            .position(|c| c.starts_with("iptables -t") && c.contains(" -A "));
        if first_rule.is_some_and(|rule| enabled.is_none_or(|enabled| enabled > rule)) {
            violations.push(format!("{gateway} got rules before forwarding was enabled"));
        }

        let tail = &commands[commands.len().saturating_sub(3)..];
        let torn_down = [
            "sysctl -w net.ipv4.ip_forward=0",
            "iptables -t nat -F",
            "iptables -t filter -F",
        ];
        if tail != torn_down {
            violations.push(format!("{gateway} was not torn down, it ends with {tail:?}"));
        }
    }

    violations
}

mod diff {
    use console::Style;
    use similar::{ChangeTag, TextDiff};

    /// Line diff of two summaries, colored for a terminal
    pub fn render(expected: &str, actual: &str) -> String {
        TextDiff::from_lines(expected, actual)
            .iter_all_changes()
            .map(|change| {
                let (sign, style) = match change.tag() {
                    ChangeTag::Delete => ("-", Style::new().red()),
                    ChangeTag::Insert => ("+", Style::new().green()),
                    ChangeTag::Equal => (" ", Style::new().dim()),
                };
                style.apply_to(format!("{sign} {change}")).to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(sequence: u64, node: &str, command: &str) -> CommandRecord {
        CommandRecord {
            sequence,
            node: node.to_string(),
            command: command.to_string(),
            status: Some(0),
            at_ms: sequence,
        }
    }

    #[test]
    fn test_summary_drops_timings() {
        let stdout = "\
--- Params ---
* Lab: tiny (labs/tiny.json)
--- Convergence ---
* Root bridge s1 elected after 31.0 s
* Forwarding: link#0, link#3, link#4
* Blocked: link#1, link#2
--- Tests ---
* h3 to h1: passed after 1 attempts
  * h3 -> 10.0.0.2 attempt 1: success
* h8 to h2: FAILED after 3 attempts
--- Summary ---
* 1/2 scenarios passed
* 412 commands executed
";
        assert_eq!(
            summarize(stdout),
            "\
convergence: root s1
forwarding links: 3
blocked links: 2
scenario h3 to h1: passed
scenario h8 to h2: FAILED
1/2 scenarios passed
"
        );
    }

    #[test]
    fn test_gateway_ordering_is_checked() {
        let good = [
            "sysctl -w net.ipv4.ip_forward=1",
            "iptables -t nat -F",
            "iptables -t nat -A POSTROUTING -s 10.1.1.0/24 -o h9-eth0 -j MASQUERADE",
            "sysctl -w net.ipv4.ip_forward=0",
            "iptables -t nat -F",
            "iptables -t filter -F",
        ];
        let log: Vec<_> = good
            .iter()
            .enumerate()
            .map(|(i, c)| record(i as u64, "h9", c))
            .collect();
        assert!(check_command_log(&log).is_empty());

        // Forwarding left on
        let violations = check_command_log(&log[..3]);
        assert_eq!(violations.len(), 1, "{violations:?}");

        let mut reordered = log;
        reordered.swap(0, 2);
        for (i, r) in reordered.iter_mut().enumerate() {
            r.sequence = i as u64;
        }
        let violations = check_command_log(&reordered);
        assert!(violations[0].contains("before forwarding"), "{violations:?}");
    }

    #[test]
    fn test_priority_precedes_spanning_tree() {
        let log = [
            record(0, "s1", "ovs-vsctl set bridge s1 stp_enable=true"),
            record(1, "s1", "ovs-vsctl set bridge s1 other_config:stp-priority=0x1000"),
        ];
        assert_eq!(check_command_log(&log).len(), 1);
    }
}
