use args::Args;
use getopts::Occur;
use glob::glob;
use malloc_trace::{record::read_log, TraceError, TraceSummary};
use std::{fs::File, io::BufReader};

const PROGRAM_DESC: &str = "Summarize malloc_trace logs";
const PROGRAM_NAME: &str = "mt_print";

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "l",
        "log",
        "Trace log(s) to read; a glob pattern",
        "PATTERN",
        Occur::Req,
        None,
    );
    args.flag("p", "post", "Print heap events (+ addr size / - addr) instead of a summary");
    args.flag("y", "yaml", "Print the summary as YAML");

    args.parse_from_cli()?;

    let pattern: String = args.value_of("log")?;
    let post: bool = args.value_of("post")?;
    let yaml: bool = args.value_of("yaml")?;

    let mut summaries = vec![];

    for path in glob(pattern.as_str())? {
        let path = path?;
        eprintln!("reading trace {}", path.display());

        let mut summary = TraceSummary::new();
        let mut malformed = 0;
        for rec in read_log(BufReader::new(File::open(&path)?)) {
            match rec {
                Ok(rec) => {
                    if post {
                        for event in rec.events() {
                            println!("{}", event);
                        }
                    }
                    summary.record(&rec);
                }
                // A process killed mid-write leaves a truncated last line.
                Err(TraceError::Parse { .. }) => malformed += 1,
                Err(e) => return Err(e.into()),
            }
        }
        if malformed > 0 {
            eprintln!("{}: skipped {} malformed lines", path.display(), malformed);
        }
        summaries.push(summary);
    }

    if summaries.is_empty() {
        anyhow::bail!("no trace logs match {}", pattern);
    }
    if post {
        return Ok(());
    }

    // Aggregate per-process summaries.
    let mut aggregate = TraceSummary::new();

    for summary in summaries.iter() {
        aggregate.merge(summary);
    }

    if yaml {
        print!("{}", serde_yaml::to_string(&aggregate)?);
    } else {
        println!("{}", aggregate);
    }

    Ok(())
}
