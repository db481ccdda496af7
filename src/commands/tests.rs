use super::*;

#[test]
fn test_parse_simple_commands() {
    assert_eq!(Command::parse("/help"), Some(Command::Help));
    assert_eq!(Command::parse("/HELP@wabridge_bot"), Some(Command::Help));
    assert_eq!(Command::parse("  /accounts  "), Some(Command::Accounts));
    assert_eq!(Command::parse("hello"), None);
    assert_eq!(Command::parse("/unknown"), None);
    assert_eq!(Command::parse(""), None);
}

#[test]
fn test_parse_arguments() {
    assert_eq!(
        Command::parse("/pair +62 812-3456-7890"),
        Some(Command::Pair("+62 812-3456-7890".into()))
    );
    assert_eq!(Command::parse("/switch 2"), Some(Command::Switch("2".into())));
    assert_eq!(Command::parse("/groups"), Some(Command::Groups(None)));
    assert_eq!(
        Command::parse("/groups team"),
        Some(Command::Groups(Some("team".into())))
    );
}

#[test]
fn test_parse_bulk_items() {
    let text = "/rename\n 1203@g.us | New name \n\n1204@g.us | Other\n";
    let Some(Command::Bulk { kind, args, items }) = Command::parse(text) else {
        panic!("expected bulk command");
    };
    assert_eq!(kind, BulkKind::Rename);
    assert!(args.is_empty());
    assert_eq!(items, vec!["1203@g.us | New name", "1204@g.us | Other"]);
    assert_eq!(split_pair(&items[0]), Some(("1203@g.us", "New name")));
}

#[test]
fn test_parse_bulk_args_and_defaults() {
    let Some(Command::Bulk { kind, args, items }) = Command::parse("/announce on") else {
        panic!("expected bulk command");
    };
    assert_eq!(kind, BulkKind::Announce);
    assert_eq!(parse_toggle(&args), Some(true));
    assert!(items.is_empty());
    assert!(kind.defaults_to_all_groups());
    assert!(!BulkKind::Leave.defaults_to_all_groups());
}

#[test]
fn test_parse_toggle_and_split_pair() {
    assert_eq!(parse_toggle("OFF"), Some(false));
    assert_eq!(parse_toggle("maybe"), None);
    assert_eq!(split_pair("no separator"), None);
    assert_eq!(split_pair(" | value"), None);
    assert_eq!(split_pair("a@g.us |"), Some(("a@g.us", "")));
}

#[test]
fn test_bot_commands_are_all_parseable() {
    for (name, _) in BOT_COMMANDS {
        assert!(
            Command::parse(&format!("/{name} x")).is_some(),
            "/{name} does not parse"
        );
    }
}
