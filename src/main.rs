mod builder;
mod document;
mod grouper;
mod models;
mod reader;
mod tracker;

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::{Arg, Command};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use builder::OfferWorkbookBuilder;
use document::save_with_retry;
use models::{Config, ID_COLUMN, OFFER_WORKBOOK_NAME, TRACKING_WORKBOOK_NAME};

fn main() -> Result<()> {
    let matches = Command::new("offer-tracker")
        .version("1.0")
        .about("Generates per-client offer tracking workbooks from application exports")
        .arg(
            Arg::new("applications")
                .value_name("CSV")
                .help("院校申请列表 export file path")
                .required(true),
        )
        .arg(
            Arg::new("tracking")
                .value_name("XLSX")
                .help("申请跟进 tracking workbook path")
                .required(true),
        )
        .arg(
            Arg::new("sheet")
                .short('s')
                .long("sheet")
                .value_name("NAME")
                .help("Tracking sheet to process (default: first sheet with a 客户id column)"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config").unwrap();
    let config = if Path::new(config_file).exists() {
        println!("📋 Loading configuration from: {}", config_file);
        Config::load_from_file(config_file)?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        let default_config = Config::default();
        default_config.save_to_file(config_file)?;
        default_config
    };

    let applications_path = matches.get_one::<String>("applications").unwrap();
    let tracking_path = matches.get_one::<String>("tracking").unwrap();

    println!("📄 Reading application export: {}", applications_path);
    let csv_bytes =
        fs::read(applications_path).with_context(|| format!("reading {}", applications_path))?;
    let table = reader::read_application_table(&csv_bytes)?;
    println!(
        "✅ Parsed {} application records across {} columns",
        table.records.len(),
        table.columns.len()
    );

    println!("📄 Reading tracking workbook: {}", tracking_path);
    let workbook_bytes =
        fs::read(tracking_path).with_context(|| format!("reading {}", tracking_path))?;
    let source = reader::read_source_workbook(&workbook_bytes)?;
    println!("✅ Loaded {} sheets", source.sheets().len());

    let selected_sheet = match matches.get_one::<String>("sheet") {
        Some(name) => name.clone(),
        None => {
            let detected = source
                .sheets()
                .iter()
                .find(|sheet| reader::find_id_column(sheet).is_some())
                .map(|sheet| sheet.name.clone())
                .ok_or_else(|| {
                    anyhow!("no sheet with a {} column in row 1", ID_COLUMN)
                })?;
            println!("   ✅ Auto-selected sheet: {}", detected);
            detected
        }
    };

    let groups = grouper::group_by_client(&table);
    println!("👥 {} clients to process", groups.len());

    let today = Local::now().date_naive();
    let offer = OfferWorkbookBuilder::new(&config, today).build(&table, &groups);
    println!("✅ Generated {} per-client sheets", offer.sheets().len());

    println!("🔗 Updating tracking workbook...");
    let tracking = tracker::TrackerUpdater::new(&config, &offer).build(&source, &selected_sheet)?;

    println!("💾 Saving workbooks...");
    let offer_bytes = save_with_retry(&offer, OFFER_WORKBOOK_NAME)?;
    let tracking_bytes = save_with_retry(&tracking, TRACKING_WORKBOOK_NAME)?;

    fs::create_dir_all(&config.output_directory)
        .with_context(|| format!("creating output directory {}", config.output_directory))?;
    let archive_path = Path::new(&config.output_directory).join(&config.archive_name);
    write_archive(&archive_path, &offer_bytes, &tracking_bytes)?;

    println!("\n✅ All done!");
    println!("📦 Archive: {}", archive_path.display());
    Ok(())
}

/// Bundle the two workbooks into a single deflate-compressed archive.
fn write_archive(path: &Path, offer_bytes: &[u8], tracking_bytes: &[u8]) -> Result<()> {
    let file =
        fs::File::create(path).with_context(|| format!("creating archive {}", path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);

    writer
        .start_file(OFFER_WORKBOOK_NAME, options)
        .context("writing archive entry header")?;
    writer.write_all(offer_bytes).context("writing archive entry")?;
    writer
        .start_file(TRACKING_WORKBOOK_NAME, options)
        .context("writing archive entry header")?;
    writer
        .write_all(tracking_bytes)
        .context("writing archive entry")?;
    writer.finish().context("finalizing archive")?;
    Ok(())
}
