//! Colored terminal summary of a run, rendered with anstyle.

use anstyle::{AnsiColor, Color, Style};
use std::fmt::Write;
use std::io::{self, Write as IoWrite};

use crate::pipeline::EmailState;
use crate::structured_output::{MetadataRecord, RunOutput};
use crate::unsubscribe::AttemptOutcome;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Style definitions for different UI elements
pub struct Styles {
    pub header: Style,
    pub subheader: Style,
    pub success: Style,
    pub warning: Style,
    pub error: Style,
    pub info: Style,
    pub muted: Style,
    pub bold: Style,
    pub email: Style,
    pub url: Style,
    pub organization: Style,
}

impl Default for Styles {
    fn default() -> Self {
        Self {
            header: Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Blue))),
            subheader: Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
            success: Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
            warning: Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Yellow))),
            error: Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
            info: Style::new().fg_color(Some(Color::Ansi(AnsiColor::Blue))),
            muted: Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack))),
            bold: Style::new().bold(),
            email: Style::new()
                .fg_color(Some(Color::Ansi(AnsiColor::Green)))
                .underline(),
            url: Style::new()
                .fg_color(Some(Color::Ansi(AnsiColor::Blue)))
                .underline(),
            organization: Style::new()
                .italic()
                .fg_color(Some(Color::Ansi(AnsiColor::BrightBlue))),
        }
    }
}

/// Human-readable run summary
pub struct StyledFormatter {
    styles: Styles,
    use_colors: bool,
}

impl StyledFormatter {
    pub fn new() -> Self {
        Self {
            styles: Styles::default(),
            use_colors: Self::should_use_colors(),
        }
    }

    /// Create a formatter without colors (for non-interactive use)
    pub fn without_colors() -> Self {
        Self {
            styles: Styles::default(),
            use_colors: false,
        }
    }

    fn should_use_colors() -> bool {
        atty::is(atty::Stream::Stdout) && std::env::var("NO_COLOR").is_err()
    }

    fn styled(&self, text: &str, style: &Style) -> String {
        if self.use_colors {
            format!("{}{}{}", style.render(), text, style.render_reset())
        } else {
            text.to_string()
        }
    }

    pub fn format_run(&self, run: &RunOutput) -> Result<String, std::fmt::Error> {
        let mut output = String::new();
        self.write_header(&mut output, run)?;
        for email in &run.emails {
            self.write_email(&mut output, email)?;
        }
        self.write_footer(&mut output, run)?;
        Ok(output)
    }

    fn write_header(&self, output: &mut String, run: &RunOutput) -> Result<(), std::fmt::Error> {
        writeln!(output)?;
        writeln!(output, "{}", self.styled(RULE, &self.styles.muted))?;
        writeln!(
            output,
            "  {}",
            self.styled(
                &format!("📬 Spam sweep {}", run.run_id),
                &self.styles.header
            )
        )?;

        let t = &run.totals;
        writeln!(
            output,
            "  {} {} found, {} completed, {} failed, {} moved",
            self.styled("📊", &self.styles.info),
            self.styled(&t.files_found.to_string(), &self.styles.bold),
            self.styled(&t.completed.to_string(), &self.styles.success),
            self.styled(
                &t.failed.to_string(),
                if t.failed > 0 {
                    &self.styles.error
                } else {
                    &self.styles.muted
                }
            ),
            t.moved
        )?;
        if t.interrupted {
            writeln!(
                output,
                "  {} {}",
                self.styled("⚠️", &self.styles.warning),
                self.styled(
                    "Interrupted: remaining files were left in place",
                    &self.styles.warning
                )
            )?;
        }
        writeln!(output, "{}", self.styled(RULE, &self.styles.muted))?;
        Ok(())
    }

    fn write_email(
        &self,
        output: &mut String,
        email: &MetadataRecord,
    ) -> Result<(), std::fmt::Error> {
        writeln!(output)?;
        let (icon, style) = match email.state {
            EmailState::Completed => ("✓", &self.styles.success),
            EmailState::Failed => ("✗", &self.styles.error),
            _ => ("…", &self.styles.warning),
        };
        let title = if email.subject.is_empty() {
            email.file.clone()
        } else {
            email.subject.clone()
        };
        writeln!(
            output,
            "  {} {}",
            self.styled(icon, style),
            self.styled(&title, &self.styles.bold)
        )?;

        if let Some(err) = &email.error {
            writeln!(
                output,
                "       {} {}",
                self.styled("└─", &self.styles.muted),
                self.styled(err, &self.styles.error)
            )?;
            return Ok(());
        }

        if !email.sender.is_empty() {
            writeln!(
                output,
                "       {} From: {}",
                self.styled("├─", &self.styles.muted),
                self.styled(&email.sender, &self.styles.email)
            )?;
        }

        for m in &email.unsubscribe {
            let outcome_style = match m.outcome {
                AttemptOutcome::Success => &self.styles.success,
                AttemptOutcome::Skipped => &self.styles.muted,
                _ => &self.styles.warning,
            };
            writeln!(
                output,
                "       {} Unsubscribe {}: {}",
                self.styled("├─", &self.styles.muted),
                self.styled(&m.outcome.to_string(), outcome_style),
                self.styled(&m.mechanism.target, &self.styles.url)
            )?;
        }

        if let Some(domain) = &email.domain {
            let registrar = domain.registrar.as_deref().unwrap_or("unknown registrar");
            writeln!(
                output,
                "       {} Domain: {} ({})",
                self.styled("├─", &self.styles.muted),
                self.styled(&domain.domain, &self.styles.bold),
                self.styled(registrar, &self.styles.organization)
            )?;
        }

        for c in &email.company_matches {
            writeln!(
                output,
                "       {} Impersonates: {} via \"{}\"",
                self.styled("├─", &self.styles.muted),
                self.styled(&c.display_name, &self.styles.organization),
                c.matched_term
            )?;
        }

        writeln!(
            output,
            "       {} {} report(s) prepared",
            self.styled("└─", &self.styles.muted),
            self.styled(&email.reports.len().to_string(), &self.styles.bold)
        )?;
        Ok(())
    }

    fn write_footer(&self, output: &mut String, run: &RunOutput) -> Result<(), std::fmt::Error> {
        let t = &run.totals;
        let day = &run.daily_summary;
        writeln!(output)?;
        writeln!(output, "{}", self.styled(RULE, &self.styles.muted))?;
        writeln!(
            output,
            "  {} This run: {} unsubscribed, {} failed, {} reports prepared",
            self.styled("📮", &self.styles.info),
            self.styled(&t.unsubscribe_successes.to_string(), &self.styles.success),
            t.unsubscribe_failures,
            t.reports_prepared
        )?;
        writeln!(
            output,
            "  {} Today ({}): {} emails over {} run(s), {} domains, {} companies",
            self.styled("📅", &self.styles.info),
            day.date,
            day.total_emails_processed,
            day.runs.len(),
            day.domains_encountered.len(),
            day.companies_identified.len()
        )?;
        writeln!(
            output,
            "    {} Ledger: {}",
            self.styled("├─", &self.styles.muted),
            self.styled(&run.files.ledger, &self.styles.muted)
        )?;
        writeln!(
            output,
            "    {} Metadata: {}",
            self.styled("├─", &self.styles.muted),
            self.styled(&run.files.email_metadata, &self.styles.muted)
        )?;
        writeln!(
            output,
            "    {} Reports: {}",
            self.styled("└─", &self.styles.muted),
            self.styled(&run.files.reports_dir, &self.styles.muted)
        )?;
        writeln!(output, "{}", self.styled(RULE, &self.styles.muted))?;
        Ok(())
    }

    pub fn print_run(&self, run: &RunOutput) -> io::Result<()> {
        let formatted = self
            .format_run(run)
            .map_err(|e| io::Error::other(format!("{}", e)))?;
        print!("{}", formatted);
        io::stdout().flush()?;
        Ok(())
    }
}

impl Default for StyledFormatter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SweepError;
    use crate::normalize::EmailFormat;
    use crate::structured_output::{DailySummary, OutputFiles, RunTotals};
    use chrono::{NaiveDate, Utc};
    use std::path::Path;

    fn run(emails: Vec<MetadataRecord>) -> RunOutput {
        RunOutput {
            tool_name: "spamsweep".into(),
            version: "0.0.0".into(),
            run_id: "20250106T101500-ab12".into(),
            generated_at: Utc::now(),
            totals: RunTotals {
                files_found: emails.len() as u64,
                failed: 1,
                interrupted: true,
                ..Default::default()
            },
            emails,
            daily_summary: DailySummary::new(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()),
            files: OutputFiles {
                ledger: "logs/action_ledger.jsonl".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_styled_formatter_creation() {
        let formatter = StyledFormatter::new();
        assert!(formatter.use_colors || !atty::is(atty::Stream::Stdout));
    }

    #[test]
    fn test_run_formatting() {
        let failed = MetadataRecord::failed(
            "00ff".into(),
            Path::new("consume/broken.msg"),
            Some(EmailFormat::Msg),
            &SweepError::parse("msg", "not a compound file"),
        );
        let output = StyledFormatter::without_colors()
            .format_run(&run(vec![failed]))
            .unwrap();

        assert!(output.contains("20250106T101500-ab12"));
        assert!(output.contains("consume/broken.msg"));
        assert!(output.contains("not a compound file"));
        assert!(output.contains("Interrupted"));
        assert!(output.contains("logs/action_ledger.jsonl"));
        assert!(!output.contains('\u{1b}'));
    }
}
