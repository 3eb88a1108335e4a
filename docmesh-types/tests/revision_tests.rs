use docmesh_types::{Revision, RevisionHistory, Seq};
use proptest::prelude::*;

// ── Revision ────────────────────────────────────────────────────

#[test]
fn revision_parse_and_display() {
    let rev: Revision = "3-abc123".parse().unwrap();
    assert_eq!(rev.generation(), 3);
    assert_eq!(rev.hash(), "abc123");
    assert_eq!(rev.to_string(), "3-abc123");
}

#[test]
fn revision_rejects_garbage() {
    assert!("abc".parse::<Revision>().is_err());
    assert!("x-abc".parse::<Revision>().is_err());
    assert!("3-".parse::<Revision>().is_err());
}

#[test]
fn revision_serializes_as_string() {
    let rev = Revision::new(2, "ff");
    let json = serde_json::to_string(&rev).unwrap();
    assert_eq!(json, "\"2-ff\"");
    let back: Revision = serde_json::from_str(&json).unwrap();
    assert_eq!(back, rev);
}

#[test]
fn revision_orders_by_generation_then_hash() {
    let a = Revision::new(2, "zzz");
    let b = Revision::new(10, "aaa");
    let c = Revision::new(10, "bbb");
    assert!(a < b);
    assert!(b < c);
}

proptest! {
    #[test]
    fn higher_generation_always_wins(g1 in 1u64..1000, g2 in 1u64..1000, h1 in "[a-f0-9]{8}", h2 in "[a-f0-9]{8}") {
        let r1 = Revision::new(g1, h1);
        let r2 = Revision::new(g2, h2);
        if g1 > g2 {
            prop_assert!(r1 > r2);
        } else if g2 > g1 {
            prop_assert!(r2 > r1);
        }
    }
}

// ── RevisionHistory ─────────────────────────────────────────────

#[test]
fn history_expands_newest_first() {
    let history = RevisionHistory {
        start: 3,
        ids: vec!["c".into(), "b".into(), "a".into()],
    };
    let revs = history.revisions();
    assert_eq!(
        revs,
        vec![Revision::new(3, "c"), Revision::new(2, "b"), Revision::new(1, "a")]
    );
}

#[test]
fn history_from_chain() {
    let chain = vec![Revision::new(2, "b"), Revision::new(1, "a")];
    let history = RevisionHistory::from_chain(&chain).unwrap();
    assert_eq!(history.start, 2);
    assert_eq!(history.ids, vec!["b", "a"]);
    assert!(RevisionHistory::from_chain(&[]).is_none());
}

#[test]
fn history_truncated_below_generation_one() {
    let history = RevisionHistory {
        start: 1,
        ids: vec!["a".into(), "bogus".into()],
    };
    assert_eq!(history.revisions(), vec![Revision::new(1, "a")]);
}

// ── Seq ─────────────────────────────────────────────────────────

#[test]
fn seq_deserializes_numbers_and_strings() {
    let n: Seq = serde_json::from_str("42").unwrap();
    let s: Seq = serde_json::from_str("\"43-g1AAAA\"").unwrap();
    assert_eq!(n.ordinal(), 42);
    assert_eq!(s.ordinal(), 43);
    assert!(n < s);
}

#[test]
fn seq_start() {
    assert!(Seq::start().is_start());
    assert!(Seq::new("0").is_start());
    assert!(!Seq::from(1).is_start());
    assert_eq!(Seq::start().ordinal(), 0);
}

#[test]
fn seq_serializes_as_string() {
    assert_eq!(serde_json::to_string(&Seq::from(7)).unwrap(), "\"7\"");
}
