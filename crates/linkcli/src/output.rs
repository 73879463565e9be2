use std::time::Duration;

use anyhow::Result;
use console::Term;
use linkcache_service::backend::UpdateInfo;
use linkcache_service::caching::{Content, LoadingCache};
use linkcache_sources::{Address, GroupKey};
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, row};

pub fn print_group(cache: &LoadingCache, group: &GroupKey, addresses: &[Address], elapsed: Duration) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Address", "Kind", "Content"]);

    for address in addresses {
        match cache.get_content(address) {
            Some(content) => {
                table.add_row(row![address, content.kind().as_str(), content.describe()]);
            }
            None => {
                table.add_row(row![address, "", "<evicted>"]);
            }
        }
    }
    table.printstd();

    // sub-millisecond precision is just noise here
    let elapsed = Duration::from_millis(elapsed.as_millis() as u64);
    println!();
    println!(
        "Loaded {} items of group `{}` in {}",
        addresses.len(),
        group,
        humantime::format_duration(elapsed)
    );
}

pub fn print_content(address: &Address, content: &Content) -> Result<()> {
    match content {
        Content::Blob(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => print!("{text}"),
            Err(_) => println!("<{} bytes of binary data at {address}>", bytes.len()),
        },
        Content::Template(template) => println!("{}", serde_json::to_string_pretty(template)?),
        Content::Record(record) => println!("{}", serde_json::to_string_pretty(record)?),
    }
    Ok(())
}

pub fn print_updates(updates: &UpdateInfo) {
    if updates.items.is_empty() {
        println!("Everything is up to date");
        return;
    }

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Changed address"]);
    for address in &updates.items {
        table.add_row(row![address]);
    }
    table.printstd();

    println!();
    println!(
        "{} items with {} bytes to download",
        updates.items.len(),
        updates.total_size
    );
}

/// Reports download progress on a single line of `stderr`.
pub struct ProgressPrinter {
    term: Term,
    last: Option<(u64, u64)>,
}

impl ProgressPrinter {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
            last: None,
        }
    }

    pub fn update(&mut self, downloaded: u64, total: u64) {
        if self.last == Some((downloaded, total)) {
            return;
        }
        self.last = Some((downloaded, total));

        let percent = match total {
            0 => 100,
            total => downloaded * 100 / total,
        };
        self.term.clear_line().ok();
        self.term
            .write_str(&format!("Downloaded {downloaded} of {total} bytes ({percent}%)"))
            .ok();
    }

    pub fn finish(self) {
        if self.last.is_some() {
            self.term.write_line("").ok();
        }
        match self.last {
            Some((downloaded, _)) => println!("Downloaded {downloaded} bytes"),
            None => println!("Nothing to download"),
        }
    }
}
