use serde_json::Value;
use std::path::PathBuf;

pub const USAGE: &str = "usage: apru40-ingest [--env-file PATH] [ingest | prune [DAYS] | expire | simulate [ROUNDS] | command GATEWAY_CODE COMMAND [PARAMS_JSON] | configure GATEWAY_CODE NODE_ID]";

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// Read `<topic> <payload>` lines from stdin until EOF.
    Ingest,
    /// One retention run, optionally overriding the configured window.
    Prune { days: Option<u32> },
    /// One stale-demotion run.
    Expire,
    /// Feed synthetic traffic for the whole inventory through the reconciler.
    Simulate { rounds: u32 },
    /// Publish one gateway command to stdout.
    Command {
        gateway_code: String,
        command: String,
        params: Value,
    },
    /// Push one node's stored configuration to stdout.
    Configure { gateway_code: String, node_id: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub env_file: Option<PathBuf>,
    pub mode: Mode,
}

pub fn parse_args<I>(args: I) -> Result<Invocation, String>
where
    I: IntoIterator<Item = String>,
{
    let mut env_file = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--env-file" {
            let path = args.next().ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
            set_once(&mut env_file, path)?;
        } else if let Some(path) = arg.strip_prefix("--env-file=") {
            set_once(&mut env_file, path.to_string())?;
        } else if arg == "-h" || arg == "--help" {
            return Err(USAGE.to_string());
        } else if arg.starts_with("--") {
            return Err(format!("unrecognised argument: {}\n{}", arg, USAGE));
        } else {
            positional.push(arg);
        }
    }

    let mode = match positional.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["ingest"] => Mode::Ingest,
        ["prune"] => Mode::Prune { days: None },
        ["prune", days] => Mode::Prune {
            days: Some(number(days, "DAYS")?),
        },
        ["expire"] => Mode::Expire,
        ["simulate"] => Mode::Simulate { rounds: 1 },
        ["simulate", rounds] => Mode::Simulate {
            rounds: number(rounds, "ROUNDS")?,
        },
        ["command", code, command] => Mode::Command {
            gateway_code: code.to_string(),
            command: command.to_string(),
            params: Value::Null,
        },
        ["command", code, command, params] => Mode::Command {
            gateway_code: code.to_string(),
            command: command.to_string(),
            params: serde_json::from_str(params).map_err(|e| format!("PARAMS_JSON is not valid JSON: {}", e))?,
        },
        ["configure", code, node_id] => Mode::Configure {
            gateway_code: code.to_string(),
            node_id: node_id
                .parse::<i32>()
                .map_err(|_| format!("NODE_ID must be an integer, got {:?}", node_id))?,
        },
        other => return Err(format!("unexpected arguments: {}\n{}", other.join(" "), USAGE)),
    };

    Ok(Invocation {
        env_file: env_file.map(PathBuf::from),
        mode,
    })
}

fn set_once(slot: &mut Option<String>, value: String) -> Result<(), String> {
    if value.is_empty() {
        return Err("`--env-file` requires a path argument".to_string());
    }
    if slot.replace(value).is_some() {
        return Err("`--env-file` provided more than once".to_string());
    }
    Ok(())
}

fn number(raw: &str, name: &str) -> Result<u32, String> {
    match raw.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("{} must be a positive integer, got {:?}", name, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> Result<Invocation, String> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn ingest_is_the_default_mode() {
        let inv = parse(&[]).expect("args");
        assert_eq!(inv.mode, Mode::Ingest);
        assert_eq!(inv.env_file, None);
    }

    #[test]
    fn parses_modes_and_env_file() {
        let inv = parse(&["--env-file", "prod.env", "prune", "30"]).expect("args");
        assert_eq!(inv.env_file, Some(PathBuf::from("prod.env")));
        assert_eq!(inv.mode, Mode::Prune { days: Some(30) });

        assert_eq!(parse(&["expire"]).expect("args").mode, Mode::Expire);
        assert_eq!(
            parse(&["--env-file=.env.test", "simulate", "5"]).expect("args").mode,
            Mode::Simulate { rounds: 5 }
        );
        assert_eq!(
            parse(&["command", "GW-07", "reboot", r#"{"delay":5}"#]).expect("args").mode,
            Mode::Command {
                gateway_code: "GW-07".into(),
                command: "reboot".into(),
                params: json!({"delay": 5}),
            }
        );
        assert_eq!(
            parse(&["configure", "GW-07", "3"]).expect("args").mode,
            Mode::Configure {
                gateway_code: "GW-07".into(),
                node_id: 3,
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse(&["--env-file"]).is_err());
        assert!(parse(&["--env-file=a", "--env-file=b"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["prune", "0"]).is_err());
        assert!(parse(&["prune", "soon"]).is_err());
        assert!(parse(&["command", "GW-07"]).is_err());
        assert!(parse(&["command", "GW-07", "reboot", "{oops"]).is_err());
        assert!(parse(&["configure", "GW-07", "three"]).is_err());
        assert!(parse(&["backfill"]).is_err());
    }
}
