//! Utilities for terminal output during campaigns.

use colorful::{Color, Colorful};

use crate::input::Opts;

/// Terminal User Interface Module for cdnscan
/// Defines macro for terminal output
#[macro_export]
macro_rules! warning {
    ($name:expr) => {
        println!("{} {}", ansi_term::Colour::Red.bold().paint("[!]"), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        // if not greppable then print, otherwise no else statement so do not print.
        if !$greppable {
            if $accessible {
                // Don't print the ascii art
                println!("{}", $name);
            } else {
                println!("{} {}", ansi_term::Colour::Red.bold().paint("[!]"), $name);
            }
        }
    };
}

#[macro_export]
macro_rules! detail {
    ($name:expr) => {
        println!("{} {}", ansi_term::Colour::Blue.bold().paint("[~]"), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", ansi_term::Colour::Blue.bold().paint("[~]"), $name);
            }
        }
    };
}

#[macro_export]
macro_rules! output {
    ($name:expr) => {
        println!(
            "{} {}",
            ansi_term::Colour::RGB(0, 255, 9).bold().paint("[>]"),
            $name
        );
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!(
                    "{} {}",
                    ansi_term::Colour::RGB(0, 255, 9).bold().paint("[>]"),
                    $name
                );
            }
        }
    };
}

/// Prints the opening banner, unless the output is meant for other programs.
pub fn print_opening(opts: &Opts) {
    if opts.greppable || opts.json || opts.accessible || opts.no_banner {
        return;
    }

    let banner = r"
  ____ ____  _   _ ____   ____    _    _   _
 / ___|  _ \| \ | / ___| / ___|  / \  | \ | |
| |   | | | |  \| \___ \| |     / _ \ |  \| |
| |___| |_| | |\  |___) | |___ / ___ \| |\  |
 \____|____/|_| \_|____/ \____/_/   \_\_| \_|
";
    println!("{}", banner.gradient(Color::Green).bold());
    println!("Edge discovery: sample, verify, rank.\n");
}
