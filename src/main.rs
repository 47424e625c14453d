use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use clap::{App, Arg};
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

use cbr_forms::error::DateError;
use cbr_forms::extract::ToolExtractor;
use cbr_forms::fetch::{FetchTuning, HttpFetcher};
use cbr_forms::periods::{Anchor, Freq, PeriodSpec};
use cbr_forms::pipeline::{run_form, CancelToken, FormContext, ProgressObserver};
use cbr_forms::{banks, config, formulas, output};

fn command_usage<'a, 'b>() -> App<'a, 'b> {
    const DEFAULT_FREQ: &str = "m";
    const DEFAULT_ANCHOR: &str = "start";
    const DEFAULT_STEP: &str = "1";
    const DEFAULT_OUT_DIR: &str = ".";
    const DEFAULT_WORKERS: &str = "1";
    const HTTP_TIMEOUT: &str = "60";
    const HTTP_RETRIES: &str = "2";
    const HTTP_BACKOFF_MS: &str = "500";
    const MIN_ARCHIVE_BYTES: &str = "512"; // missing archives come back as small HTML stubs, not 404s

    App::new("cbr-forms")
    .about("Downloads Bank of Russia credit institution reporting forms and builds wide summary tables")
    .arg(
        Arg::with_name("from")
            .short("f")
            .long("from")
            .takes_value(true)
            .required(true)
            .help("First report date to cover, YYYY-MM-DD")
    )
    .arg(
        Arg::with_name("to")
            .long("to")
            .takes_value(true)
            .help("Last report date to cover, YYYY-MM-DD; today when omitted")
    )
    .arg(
        Arg::with_name("freq")
            .long("freq")
            .takes_value(true)
            .default_value(DEFAULT_FREQ)
            .help("Report frequency: y, q, m, w or d")
    )
    .arg(
        Arg::with_name("anchor")
            .long("anchor")
            .takes_value(true)
            .default_value(DEFAULT_ANCHOR)
            .help("Which edge of each period to report on: start or end")
    )
    .arg(
        Arg::with_name("step")
            .long("step")
            .takes_value(true)
            .default_value(DEFAULT_STEP)
            .help("Keep every Nth period of the grid")
    )
    .arg(
        Arg::with_name("forms")
            .long("forms")
            .takes_value(true)
            .multiple(true)
            .use_delimiter(true)
            .help("Form codes to run, e.g. 101,135; every configured form when omitted")
    )
    .arg(
        Arg::with_name("out-dir")
            .short("o")
            .long("out-dir")
            .takes_value(true)
            .default_value(DEFAULT_OUT_DIR)
            .help("Directory the summary tables are written into")
    )
    .arg(
        Arg::with_name("forms-config")
            .long("forms-config")
            .takes_value(true)
            .default_value(config::DEFAULT_FORMS_PATH)
            .help("Location of the form catalogue")
    )
    .arg(
        Arg::with_name("banks")
            .long("banks")
            .takes_value(true)
            .default_value(banks::DEFAULT_BANKS_PATH)
            .help("Location of the bank panel")
    )
    .arg(
        Arg::with_name("formulas")
            .long("formulas")
            .takes_value(true)
            .default_value(formulas::DEFAULT_FORMULAS_PATH)
            .help("Location of the formula models")
    )
    .arg(
        Arg::with_name("http-timeout")
            .long("http-timeout")
            .takes_value(true)
            .default_value(HTTP_TIMEOUT)
            .help("HTTP connect/read timeout in seconds")
    )
    .arg(
        Arg::with_name("retries")
            .long("retries")
            .takes_value(true)
            .default_value(HTTP_RETRIES)
            .help("Extra download attempts after a failure")
    )
    .arg(
        Arg::with_name("backoff-ms")
            .long("backoff-ms")
            .takes_value(true)
            .default_value(HTTP_BACKOFF_MS)
            .help("Base delay between download attempts in milliseconds; grows linearly")
    )
    .arg(
        Arg::with_name("min-bytes")
            .long("min-bytes")
            .takes_value(true)
            .default_value(MIN_ARCHIVE_BYTES)
            .help("Smallest believable archive size in bytes")
    )
    .arg(
        Arg::with_name("workers")
            .short("w")
            .long("workers")
            .takes_value(true)
            .default_value(DEFAULT_WORKERS)
            .help("Report dates processed concurrently per form; 1 keeps the run strictly sequential")
    )
    .arg(
        Arg::with_name("extract-tool")
            .long("extract-tool")
            .takes_value(true)
            .help("Archive tool to use instead of probing PATH: unrar, 7z, 7zz or bsdtar")
    )
    .arg(
        Arg::with_name("dbf-snapshots")
            .long("dbf-snapshots")
            .takes_value(false)
            .help("Also write a dBase snapshot next to each CSV summary")
    )
    .arg(
        Arg::with_name("verbose")
            .short("v")
            .long("verbose")
            .help("Enable debug logging")
    )
}

fn init_tracing(verbose: bool) {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_max_level(level)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Per-date progress counters at info level; failure causes stay on the
/// pipeline's own warn lines.
#[derive(Default)]
struct LogProgress {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl ProgressObserver for LogProgress {
    fn started(&self, form: &str, dates: usize) {
        self.total.store(dates, Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        info!(form, dates, "processing report dates");
    }

    fn date_ok(&self, form: &str, date: NaiveDate, records: usize) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        info!(form, date = %date, records, "{}/{}", done, self.total.load(Ordering::SeqCst));
    }

    fn date_skipped(&self, form: &str, date: NaiveDate, _error: &DateError) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        info!(form, date = %date, "{}/{} (skipped)", done, self.total.load(Ordering::SeqCst));
    }
}

fn main() {
    let matches = command_usage().get_matches();
    init_tracing(matches.is_present("verbose"));

    let from = NaiveDate::parse_from_str(matches.value_of("from").unwrap(), "%Y-%m-%d")
        .expect(&format!("Invalid from date specified: '{}'", matches.value_of("from").unwrap()));
    let to = match matches.value_of("to") {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .expect(&format!("Invalid to date specified: '{}'", raw)),
        None => Local::now().date_naive(),
    };
    let freq = Freq::from_label(matches.value_of("freq").unwrap())
        .expect(&format!("Invalid frequency specified: '{}'", matches.value_of("freq").unwrap()));
    let anchor = Anchor::from_label(matches.value_of("anchor").unwrap())
        .expect(&format!("Invalid anchor specified: '{}'", matches.value_of("anchor").unwrap()));
    let step = matches.value_of("step").unwrap().parse::<u32>()
        .expect(&format!("Invalid step specified: '{}'", matches.value_of("step").unwrap()));

    let grid = PeriodSpec::new(freq, anchor, step).expect("Invalid period grid");
    let dates = grid.points(from, to);
    if dates.is_empty() {
        eprintln!("No report dates between {} and {}", from, to);
        process::exit(2);
    }
    info!(count = dates.len(), from = %from, to = %to, "report dates generated");

    let catalogue = config::load_forms(Path::new(matches.value_of("forms-config").unwrap()))
        .expect("Failed to load the form catalogue");
    let wanted: Vec<String> = match matches.values_of("forms") {
        Some(values) => values.map(str::to_owned).collect(),
        None => Vec::new(),
    };
    let picked = config::select_forms(&catalogue, &wanted)
        .expect("Failed to resolve the requested forms");

    let panel = banks::load_banks(Path::new(matches.value_of("banks").unwrap()))
        .expect("Failed to load the bank panel");
    info!(banks = panel.len(), "bank panel loaded");
    let models = formulas::load_formulas(Path::new(matches.value_of("formulas").unwrap()))
        .expect("Failed to load the formula models");
    info!(formulas = models.len(), "formula models loaded");

    let timeout = matches.value_of("http-timeout").unwrap().parse::<u64>()
        .expect(&format!("Invalid http timeout specified: '{}'", matches.value_of("http-timeout").unwrap()));
    let retries = matches.value_of("retries").unwrap().parse::<u32>()
        .expect(&format!("Invalid retry count specified: '{}'", matches.value_of("retries").unwrap()));
    let backoff = matches.value_of("backoff-ms").unwrap().parse::<u64>()
        .expect(&format!("Invalid backoff specified: '{}'", matches.value_of("backoff-ms").unwrap()));
    let min_bytes = matches.value_of("min-bytes").unwrap().parse::<usize>()
        .expect(&format!("Invalid minimum size specified: '{}'", matches.value_of("min-bytes").unwrap()));
    let workers = matches.value_of("workers").unwrap().parse::<usize>()
        .expect(&format!("Invalid worker count specified: '{}'", matches.value_of("workers").unwrap()))
        .max(1);

    let fetcher = HttpFetcher::new(FetchTuning {
        timeout: Duration::from_secs(timeout),
        retries,
        backoff: Duration::from_millis(backoff),
        min_bytes,
    });
    let extractor = match matches.value_of("extract-tool") {
        Some(program) => ToolExtractor::with_program(program),
        None => ToolExtractor::locate().expect("No usable archive tool on PATH"),
    };

    let out_dir = PathBuf::from(matches.value_of("out-dir").unwrap());
    fs::create_dir_all(&out_dir)
        .expect(&format!("Cannot create output directory '{}'", out_dir.display()));

    let cancel = CancelToken::new();
    let progress = LogProgress::default();
    let ctx = FormContext {
        fetcher: &fetcher,
        extractor: &extractor,
        cancel: &cancel,
        observer: &progress,
        workers,
    };

    let total = picked.len();
    let mut exported = 0usize;
    for (form_id, cfg) in picked {
        let picked_models = formulas::formulas_for(&models, form_id);
        let outcome = match run_form(form_id, cfg, &dates, &panel, &picked_models, &ctx) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(form = form_id, error = %e, "form failed, moving on");
                continue;
            }
        };
        if outcome.processed == 0 {
            warn!(form = form_id, "no report date produced a table, export skipped");
            continue;
        }
        let path = output::summary_path(&out_dir, form_id);
        if let Err(e) = output::export_csv(&path, &outcome.table) {
            warn!(form = form_id, error = %e, "summary export failed");
            continue;
        }
        if matches.is_present("dbf-snapshots") {
            if let Err(e) = output::export_dbf(&path.with_extension("dbf"), &outcome.table) {
                warn!(form = form_id, error = %e, "snapshot export failed");
            }
        }
        info!(
            form = form_id,
            name = %outcome.name,
            processed = outcome.processed,
            skipped = outcome.skipped,
            path = %path.display(),
            "summary written"
        );
        exported += 1;
    }

    info!(forms = total, exported, "run finished");
    if exported == 0 {
        error!("no form produced a summary");
        process::exit(1);
    }
}
