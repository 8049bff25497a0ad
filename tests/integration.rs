use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use vstm::{Stm, StmError, TxnStatus, tracked_fields};

#[test]
fn test_basic_transaction() {
    let stm = Stm::new();
    let var = stm.object(10i64);

    let result = stm
        .atomically(|tx| {
            let val = var.get(tx)?;
            var.set(tx, val + 5)?;
            Ok(val)
        })
        .unwrap();

    assert_eq!(result, 10);
    assert_eq!(stm.atomically(|tx| var.get(tx)).unwrap(), 15);
}

#[test]
fn test_failed_body_leaves_no_trace() {
    let stm = Stm::new();
    let var = stm.object(10i64);

    let result: Result<(), StmError> = stm.atomically(|tx| {
        var.set(tx, 20)?;
        Err(StmError::domain("body failed after writing"))
    });

    assert!(matches!(result, Err(StmError::Domain(_))));
    assert_eq!(stm.atomically(|tx| var.get(tx)).unwrap(), 10);
    assert!(!var.is_locked());
}

#[test]
fn test_read_your_own_writes() {
    let stm = Stm::new();
    let var = stm.object(10i64);

    stm.atomically(|tx| {
        assert_eq!(var.get(tx)?, 10);
        var.set(tx, 20)?;
        assert_eq!(var.get(tx)?, 20);
        var.set(tx, 30)?;
        assert_eq!(var.get(tx)?, 30);
        Ok(())
    })
    .unwrap();

    assert_eq!(var.atomic_get(), Some(30));
}

#[test]
fn test_multiple_objects_atomic_swap() {
    let stm = Stm::new();
    let acc1 = stm.object(100i64);
    let acc2 = stm.object(0i64);

    stm.atomically(|tx| {
        let v1 = acc1.get(tx)?;
        let v2 = acc2.get(tx)?;
        acc1.set(tx, v1 - 50)?;
        acc2.set(tx, v2 + 50)?;
        Ok(())
    })
    .unwrap();

    let (v1, v2) = stm
        .atomically(|tx| Ok((acc1.get(tx)?, acc2.get(tx)?)))
        .unwrap();
    assert_eq!(v1, 50);
    assert_eq!(v2, 50);
}

#[test]
fn test_alter_and_get_and_set() {
    let stm = Stm::new();
    let var = stm.object(String::from("a"));

    let altered = stm
        .atomically(|tx| var.alter(tx, |s| s + "b"))
        .unwrap();
    assert_eq!(altered, "ab");

    let previous = stm
        .atomically(|tx| var.get_and_set(tx, String::from("c")))
        .unwrap();
    assert_eq!(previous, "ab");
    assert_eq!(var.atomic_get().as_deref(), Some("c"));
}

#[test]
fn test_abort_is_idempotent() {
    let stm = Stm::new();
    let var = stm.object(1i64);
    let factory = stm.factory().speculative(false).build().unwrap();

    let mut tx = factory.begin();
    var.set(&mut tx, 2).unwrap();
    tx.abort().unwrap();
    tx.abort().unwrap();
    assert_eq!(tx.status(), TxnStatus::Aborted);
    assert_eq!(var.atomic_get(), Some(1));
}

#[derive(Clone, Debug, PartialEq)]
struct Account {
    balance: i64,
    owner: Arc<String>,
}

tracked_fields!(Account { balance, owner });

#[test]
fn test_struct_values_and_dirty_check() {
    let stm = Stm::new();
    let owner = Arc::new(String::from("ann"));
    let account = stm.object(Account {
        balance: 10,
        owner: owner.clone(),
    });

    // Rewriting the same fields publishes nothing.
    stm.atomically(|tx| {
        let draft = tx.open_for_write(&account)?;
        draft.balance = 10;
        draft.owner = owner.clone();
        Ok(())
    })
    .unwrap();
    assert_eq!(account.version(), vstm::INITIAL_VERSION);

    // Equal contents in a new allocation is a write.
    stm.atomically(|tx| {
        tx.open_for_write(&account)?.owner = Arc::new(String::from("ann"));
        Ok(())
    })
    .unwrap();
    assert!(account.version() > vstm::INITIAL_VERSION);
}

#[test]
fn test_construct_inside_transaction() {
    let stm = Stm::new();
    let list = stm
        .atomically(|tx| {
            let head = tx.new_object(1u32)?;
            let tail = tx.new_object(2u32)?;
            Ok((head, tail))
        })
        .unwrap();

    assert_eq!(list.0.atomic_get(), Some(1));
    assert_eq!(list.1.atomic_get(), Some(2));
    assert_eq!(list.0.version(), list.1.version());
}

#[test]
fn test_commute_and_hooks() {
    let stm = Stm::new();
    let hits = stm.object(0u64);
    let committed = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        stm.atomically(|tx| {
            hits.commute(tx, |n| *n += 1)?;
            let committed = committed.clone();
            tx.on_commit(move || {
                committed.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        })
        .unwrap();
    }

    assert_eq!(hits.atomic_get(), Some(5));
    assert_eq!(committed.load(Ordering::SeqCst), 5);
}

#[test]
fn test_ambient_execute() {
    let stm = Stm::new();
    let a = stm.object(1i64);
    let b = stm.object(2i64);

    let sum = stm
        .execute(|| {
            let sum = a.ambient_get()? + b.ambient_get()?;
            b.ambient_set(sum)?;
            Ok(sum)
        })
        .unwrap();

    assert_eq!(sum, 3);
    assert_eq!(b.atomic_get(), Some(3));
    assert!(matches!(a.ambient_get(), Err(StmError::NoTransaction)));
}

#[test]
fn test_abort_only_is_not_retried() {
    let stm = Stm::new();
    let var = stm.object(0i64);
    let attempts = AtomicUsize::new(0);

    let result = stm.atomically(|tx| {
        attempts.fetch_add(1, Ordering::SeqCst);
        var.set(tx, 1)?;
        tx.set_abort_only()
    });

    assert!(matches!(result, Err(StmError::AbortOnly { .. })));
    assert_eq!(var.atomic_get(), Some(0));
    // The first attempt may have restarted speculatively; the abort-only one is final.
    assert!(attempts.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_invalid_factory_configuration() {
    let stm = Stm::new();
    let result = stm
        .factory()
        .isolation(vstm::IsolationLevel::Serializable)
        .read_tracking(false)
        .build();
    assert!(matches!(result, Err(StmError::Config(_))));
}
