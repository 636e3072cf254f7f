use clap::ColorChoice;
use owo_colors::{OwoColorize, Style};
use std::sync::OnceLock;

static STYLES: OnceLock<Styles> = OnceLock::new();

#[derive(Clone, Debug, Default)]
struct Styles {
    bold: Style,
    info: Style,
    success: Style,
    warning: Style,
    failure: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.bold = Style::new().bold();
        self.info = Style::new().blue();
        self.success = Style::new().green();
        self.warning = Style::new().yellow();
        self.failure = Style::new().red();
    }
}

pub fn init(choice: ColorChoice) {
    let enabled = match choice {
        ColorChoice::Auto => supports_color::on_cached(supports_color::Stream::Stdout).is_some(),
        ColorChoice::Always => true,
        ColorChoice::Never => false,
    };
    let mut styles = Styles::default();
    if enabled {
        styles.colorize();
    }
    let _ = STYLES.set(styles);
}

fn styles() -> &'static Styles {
    STYLES.get_or_init(Styles::default)
}

pub fn header(message: &str) {
    println!();
    println!("{}", format!("=== {message} ===").style(styles().bold));
}

pub fn info(message: &str) {
    println!("{} {message}", "[INFO]".style(styles().info));
}

pub fn success(message: &str) {
    println!("{} {message}", "[SUCCESS]".style(styles().success));
}

pub fn warning(message: &str) {
    println!("{} {message}", "[WARNING]".style(styles().warning));
}

pub fn error(message: &str) {
    eprintln!("{} {message}", "[ERROR]".style(styles().failure));
}

pub fn dump(label: &str, contents: &str) {
    println!("{}", format!("--- {label} ---").style(styles().bold));
    if contents.trim().is_empty() {
        println!("    (empty)");
        return;
    }
    for line in contents.lines() {
        println!("    {line}");
    }
}
