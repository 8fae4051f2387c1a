use clap::{Parser, Subcommand, ValueEnum};
use rdb::{Database, DatabaseOptions, Direction, Operator, Query, Record, Rule, SubscriptionEvent};
use serde_json::{json, Value};
use std::process;

/// rdb CLI: inspect and edit a directory of JSON table files
#[derive(Parser)]
#[command(name = "rdb", version, about)]
struct Cli {
    /// Path to the data directory (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: String,

    /// Schema file (YAML or JSON list of tables). Without it, tables are
    /// discovered from existing *_table.json files.
    #[arg(long)]
    schema: Option<String>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

/// Rule filters shared by the commands that select records.
#[derive(clap::Args)]
struct Filter {
    /// Rule that must hold (e.g. --and age:>:30). Repeatable.
    #[arg(long = "and", value_parser = parse_rule)]
    and: Vec<Rule>,
    /// Rule of which at least one must hold (e.g. --or name:regex:^A). Repeatable.
    #[arg(long = "or", value_parser = parse_rule)]
    or: Vec<Rule>,
    /// Column to sort by
    #[arg(long)]
    order_by: Option<String>,
    /// Sort descending
    #[arg(long)]
    desc: bool,
    /// Maximum number of records
    #[arg(long)]
    limit: Option<usize>,
}

impl Filter {
    fn apply(self, mut query: Query) -> Query {
        for rule in self.and {
            query = query.and_where(rule);
        }
        for rule in self.or {
            query = query.or_where(rule);
        }
        if let Some(column) = self.order_by {
            let direction = if self.desc { Direction::Desc } else { Direction::Asc };
            query = query.order_by(column, direction);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }
}

#[derive(Subcommand)]
enum Command {
    /// List tables with their row counts
    Tables,

    /// Show a table's schema
    Schema {
        /// Table name
        table: String,
    },

    /// Find records
    Find {
        /// Table name
        table: String,
        #[command(flatten)]
        filter: Filter,
    },

    /// Insert a new record
    Insert {
        /// Table name
        table: String,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update matching records
    Update {
        /// Table name
        table: String,
        #[command(flatten)]
        filter: Filter,
        /// Field values to set (e.g. --field status=published)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete matching records
    Delete {
        /// Table name
        table: String,
        #[command(flatten)]
        filter: Filter,
        /// Show what would be deleted without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete a table and its file
    Drop {
        /// Table name
        table: String,
    },

    /// Print changes to matching records as they happen
    Watch {
        /// Table name
        table: String,
        #[command(flatten)]
        filter: Filter,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval: u64,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// `column:operator:value`; the value is parsed as JSON when possible.
fn parse_rule(s: &str) -> Result<Rule, String> {
    let mut parts = s.splitn(3, ':');
    let (Some(column), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("Invalid rule '{s}': expected column:operator:value"));
    };
    let op = Operator::parse(op).ok_or_else(|| format!("Unknown operator '{op}' in '{s}'"))?;
    Ok(Rule::new(column, op, parse_value(value)))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = DatabaseOptions::directory(&cli.data_dir);
    if let Some(schema) = &cli.schema {
        options = options.with_schema_file(schema)?;
    }
    if let Command::Watch { interval, .. } = &cli.command {
        options = options.with_poll_interval(std::time::Duration::from_millis(*interval));
    }
    let mut db = Database::open(options)?;
    log::debug!(
        "Opened {} with tables: {}",
        db.directory().display(),
        db.table_names().join(", ")
    );

    match cli.command {
        Command::Tables => {
            let mut tables = serde_json::Map::new();
            for table in db.tables() {
                tables.insert(table.name().to_string(), json!(table.count()?));
            }
            print_output(&Value::Object(tables), &cli.format)?;
        }

        Command::Schema { table } => {
            let table = db.table(&table)?;
            print_output(&serde_json::to_value(table.schema())?, &cli.format)?;
        }

        Command::Find { table, filter } => {
            let records = filter.apply(db.query(&table)?).execute()?;
            print_output(&records_to_value(&records), &cli.format)?;
        }

        Command::Insert { table, fields } => {
            let record = db.table(&table)?.insert(fields_to_row(&fields))?;
            print_output(&record.to_json(), &cli.format)?;
        }

        Command::Update {
            table,
            filter,
            fields,
        } => {
            let changed = filter
                .apply(db.query(&table)?)
                .set(fields_to_row(&fields))
                .execute()?;
            print_output(
                &json!({ "ok": true, "updated": changed.len(), "records": records_to_value(&changed) }),
                &cli.format,
            )?;
        }

        Command::Delete {
            table,
            filter,
            dry_run,
        } => {
            let query = filter.apply(db.query(&table)?);
            if dry_run {
                let records = query.find()?;
                print_output(
                    &json!({ "dry_run": true, "would_delete": records_to_value(&records) }),
                    &cli.format,
                )?;
            } else {
                let removed = query.delete().execute()?;
                print_output(
                    &json!({ "ok": true, "deleted": removed.iter().map(Record::id).collect::<Vec<_>>() }),
                    &cli.format,
                )?;
            }
        }

        Command::Drop { table } => {
            db.drop(&table)?;
            print_output(&json!({ "ok": true, "dropped": table }), &cli.format)?;
        }

        Command::Watch { table, filter, .. } => {
            let query = filter.apply(db.query(&table)?);
            let initial = query.find()?;
            print_output(&records_to_value(&initial), &cli.format)?;

            let (_subscription, events) = query.watch()?;
            for event in events {
                print_output(&event_to_value(&event), &cli.format)?;
            }
        }
    }

    Ok(())
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn fields_to_row(fields: &[(String, String)]) -> rdb::Row {
    fields
        .iter()
        .map(|(key, val)| (key.clone(), parse_value(val)))
        .collect()
}

fn records_to_value(records: &[Record]) -> Value {
    Value::Array(records.iter().map(Record::to_json).collect())
}

fn event_to_value(event: &SubscriptionEvent) -> Value {
    json!({
        "event": format!("{:?}", event.kind).to_lowercase(),
        "records": records_to_value(&event.records),
        "count": event.snapshot.len(),
    })
}
