use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::env::MapEnv;
use crate::errors::KconfigError;
use crate::reader::{ReadOptions, SourceReader};

fn reader(text: &str) -> SourceReader {
    SourceReader::from_string("test.in", text, 4, Arc::new(MapEnv::new()))
}

#[test]
fn skips_blanks_and_comments() {
    let mut r = reader("# header\n\n  \nconfig FOO # trailing\n");
    let line = r.next_line(ReadOptions::default()).unwrap().unwrap();
    assert_eq!(line, "config FOO");
    assert_eq!(r.location().line, 4);
    assert!(r.next_line(ReadOptions::default()).unwrap().is_none());
}

#[test]
fn hash_inside_quotes_survives() {
    let mut r = reader("prompt \"color #1\"\n");
    let line = r.next_line(ReadOptions::default()).unwrap().unwrap();
    assert_eq!(line, "prompt \"color #1\"");
}

#[test]
fn push_back_restores_line_and_location() {
    let mut r = reader("config A\nconfig B\n");
    let first = r.next_line(ReadOptions::default()).unwrap().unwrap();
    assert_eq!(r.location().line, 1);
    let second = r.next_line(ReadOptions::default()).unwrap().unwrap();
    r.push_back(second.clone());
    assert_eq!(r.next_line(ReadOptions::default()).unwrap().unwrap(), second);
    assert_eq!(r.location().line, 2);
    assert_eq!(first, "config A");
}

#[test]
fn tabs_expand_to_configured_width() {
    let mut r = reader("\thelp text\n");
    let line = r.next_line(ReadOptions::raw()).unwrap().unwrap();
    assert_eq!(line, "    help text");

    let mut r = SourceReader::from_string("t", "a\tb\n", 8, Arc::new(MapEnv::new()));
    let line = r.next_line(ReadOptions::raw()).unwrap().unwrap();
    assert_eq!(line, "a       b");
}

#[test]
fn env_expansion_inside_quotes_only() {
    let env = MapEnv::with([("ARCH", "x86")]);
    let mut r = SourceReader::from_string(
        "t",
        "source \"arch/$ARCH/Kconfig\"\ndepends on $ARCH\n",
        4,
        Arc::new(env),
    );
    let line = r.next_line(ReadOptions::default()).unwrap().unwrap();
    assert_eq!(line, "source \"arch/x86/Kconfig\"");
    // Outside quotes the `$` is left alone.
    let line = r.next_line(ReadOptions::default()).unwrap().unwrap();
    assert_eq!(line, "depends on $ARCH");
}

#[test]
fn unset_env_var_is_fatal_and_located() {
    let mut r = reader("source \"$MISSING/Kconfig\"\n");
    let err = r.next_line(ReadOptions::default()).unwrap_err();
    match err.downcast_ref::<KconfigError>() {
        Some(KconfigError::Env { file, line, var }) => {
            assert_eq!(file, "test.in");
            assert_eq!(*line, 1);
            assert_eq!(var, "MISSING");
        }
        other => panic!("expected Env error, got {:?}", other),
    }
}

#[test]
fn raw_mode_preserves_blanks_and_hashes() {
    let mut r = reader("  first\n\n  # not a comment\n");
    assert_eq!(r.next_line(ReadOptions::raw()).unwrap().unwrap(), "  first");
    assert_eq!(r.next_line(ReadOptions::raw()).unwrap().unwrap(), "");
    assert_eq!(
        r.next_line(ReadOptions::raw()).unwrap().unwrap(),
        "  # not a comment"
    );
}
