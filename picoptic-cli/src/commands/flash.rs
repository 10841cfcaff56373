//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use picoptic::port::DEFAULT_BAUD;
use picoptic::protocol::optic::is_protected;
use picoptic::{DownloadSummary, NativePort, OpticFlasher, SerialConfig, SessionOptions};
use std::path::PathBuf;

use super::load_image;
use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

/// Everything `flash` was asked to do.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlashRequest {
    pub(crate) image: PathBuf,
    pub(crate) port: Option<String>,
    pub(crate) ignore_out_of_range: bool,
    pub(crate) ignore_protected: bool,
    pub(crate) ignore_battery: bool,
    pub(crate) map: bool,
    pub(crate) no_chime: bool,
    pub(crate) invalidate_on_failure: bool,
    pub(crate) min_volts: Option<f32>,
}

impl FlashRequest {
    /// Command-line flags layered over the configured policy.
    ///
    /// A flag can only switch a relaxation on; it never turns off one the
    /// config file enabled.
    fn session_options(&self, config: &Config) -> SessionOptions {
        let mut options = config.session_options();
        options.ignore_protected |= self.ignore_protected;
        options.ignore_battery |= self.ignore_battery;
        options.invalidate_on_failure |= self.invalidate_on_failure;
        if self.no_chime {
            options.chime = false;
        }
        if let Some(volts) = self.min_volts {
            options.min_battery_volts = volts;
        }
        options
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, request: &FlashRequest) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            request
                .image
                .display()
        );
    }

    let ignore_out_of_range = request.ignore_out_of_range
        || config
            .flash
            .ignore_out_of_range
            .unwrap_or(false);
    let image = load_image(&request.image, ignore_out_of_range)?;

    if !cli.quiet {
        let pages: Vec<u8> = image
            .programmed_pages()
            .collect();
        eprintln!(
            "{} {} words in {} pages",
            style("ℹ").blue(),
            image.programmed_words(),
            pages.len()
        );
    }
    if request.map {
        print!("{}", image.page_map());
    }

    let options = request.session_options(config);
    if !options.ignore_protected {
        if let Some(page) = image
            .programmed_pages()
            .find(|&p| is_protected(p))
        {
            return Err(picoptic::Error::ProtectedPage { page }.into());
        }
    }

    let port_name = get_port(cli, request.port.as_ref(), config)?;
    let baud = cli
        .baud
        .or(config.port.baud)
        .unwrap_or(DEFAULT_BAUD);
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            port_name,
            baud
        );
    }

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("failed to open {port_name}"))?;
    let mut flasher = OpticFlasher::new(port, options);
    if let Err(err) = ensure_not_interrupted() {
        let _ = flasher.close();
        return Err(err);
    }

    if !cli.quiet {
        eprintln!("{} Waiting for the adapter", style("⏳").yellow());
    }
    if let Err(err) = flasher.settle() {
        let _ = flasher.close();
        return Err(err.into());
    }

    let pb = progress_bar(cli);
    let result = flasher.download(&image, |page, done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        pb.set_message(format!("(page {page})"));
    });

    let _ = flasher.close();
    let summary = match result {
        Ok(summary) => summary,
        Err(err) => {
            pb.abandon();
            return Err(err).context(format!("download to {port_name} failed"));
        },
    };
    pb.finish_and_clear();

    if !cli.quiet {
        report(&summary);
    }
    Ok(())
}

fn report(summary: &DownloadSummary) {
    eprintln!(
        "{} Battery {:.2} V",
        style("✓").green(),
        summary.battery_volts
    );
    if !summary
        .pages_skipped
        .is_empty()
    {
        eprintln!(
            "{} Left out protected pages {:?}",
            style("⚠").yellow(),
            summary.pages_skipped
        );
    }
    if summary.retries > 0 {
        eprintln!(
            "{} {} page writes retried",
            style("⚠").yellow(),
            summary.retries
        );
    }
    eprintln!(
        "\n{} {} pages written, application started",
        style("🎉").green().bold(),
        summary
            .pages_written
            .len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        config.flash.chime = Some(true);
        config.flash.min_battery_volts = Some(2.4);
        config.flash.ignore_battery = Some(true);

        let request = FlashRequest {
            no_chime: true,
            min_volts: Some(2.1),
            ignore_protected: true,
            ..FlashRequest::default()
        };
        let options = request.session_options(&config);
        assert!(!options.chime);
        assert!((options.min_battery_volts - 2.1).abs() < f32::EPSILON);
        assert!(options.ignore_protected);
        assert!(options.ignore_battery);
        assert!(!options.invalidate_on_failure);
    }

    #[test]
    fn test_defaults_without_flags_or_config() {
        let options = FlashRequest::default().session_options(&Config::default());
        assert_eq!(options, SessionOptions::default());
    }
}
