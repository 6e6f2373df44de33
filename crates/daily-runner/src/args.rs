use pipeline_core::calendar::parse_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Plan,
    Status,
    Validate,
    Analyze,
    Brief,
    MorningCall,
    PriceUpdate,
    All,
}

impl Job {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "plan" => Some(Job::Plan),
            "status" => Some(Job::Status),
            "validate" => Some(Job::Validate),
            "analyze" => Some(Job::Analyze),
            "brief" => Some(Job::Brief),
            "morning-call" => Some(Job::MorningCall),
            "price-update" => Some(Job::PriceUpdate),
            "all" => Some(Job::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunArgs {
    pub job: Job,
    /// `YYYY-MM-DD`; defaults to today in the market timezone.
    pub date: Option<String>,
    pub symbols: Option<Vec<String>>,
    pub force: bool,
    pub dry_run: bool,
}

pub const USAGE: &str = "\
Usage:
  daily-runner <job> [options]

Jobs:
  plan            Seed today's task plan and print the dashboard
  status          Print the task dashboard
  validate        Adjudicate predictions targeting the date
  analyze         Run the model race for every watched symbol
  brief           Phase 1 stock briefs, then Phase 2 user briefs and pushes
  morning-call    Push the pre-market summary of today's calls
  price-update    Broadcast that prices for the date are in
  all             plan, validate, analyze, brief

Options:
  --date YYYY-MM-DD     Run for this date instead of today
  --symbols A B ...     Restrict analyze/brief to these symbols
  --force               Re-run models that already have a prediction
  --dry-run             Log notifications without pushing";

/// `args` excludes the program name.
pub fn parse_args(args: &[String]) -> Result<RunArgs, String> {
    let job_name = args.first().ok_or_else(|| "missing job".to_string())?;
    let job = Job::parse(job_name).ok_or_else(|| format!("unknown job '{}'", job_name))?;

    let date = match args.iter().position(|a| a == "--date") {
        Some(i) => {
            let raw = args.get(i + 1).ok_or_else(|| "--date needs a value".to_string())?;
            parse_date(raw).map_err(|e| e.to_string())?;
            Some(raw.clone())
        }
        None => None,
    };

    let symbols = args.iter().position(|a| a == "--symbols").map(|i| {
        args[i + 1..]
            .iter()
            .take_while(|a| !a.starts_with("--"))
            .cloned()
            .collect::<Vec<_>>()
    });
    if symbols.as_ref().is_some_and(|s| s.is_empty()) {
        return Err("--symbols needs at least one symbol".to_string());
    }

    Ok(RunArgs {
        job,
        date,
        symbols,
        force: args.iter().any(|a| a == "--force"),
        dry_run: args.iter().any(|a| a == "--dry-run"),
    })
}
