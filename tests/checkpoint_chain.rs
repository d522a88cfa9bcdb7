use anyhow::Error;

use virtsparse::checkpoint::CheckpointChain;
use virtsparse::{JobError, Level, CHECKPOINT_PREFIX};

#[test]
fn chain_persists_across_loads() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;

    let mut chain = CheckpointChain::load(dir.path(), "vm1")?;
    assert!(chain.is_empty());
    assert_eq!(chain.next_name(), format!("{}.0", CHECKPOINT_PREFIX));

    chain.append(chain.next_name())?;
    chain.append(chain.next_name())?;

    let reloaded = CheckpointChain::load(dir.path(), "vm1")?;
    assert_eq!(
        reloaded.names(),
        &[
            format!("{}.0", CHECKPOINT_PREFIX),
            format!("{}.1", CHECKPOINT_PREFIX)
        ]
    );
    assert_eq!(reloaded.last(), Some("virtsparse.1"));

    // other domains have their own chain file
    let other = CheckpointChain::load(dir.path(), "vm2")?;
    assert!(other.is_empty());
    Ok(())
}

#[test]
fn corrupt_chain_is_fatal() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("vm1.cpt"), b"not json")?;
    assert!(CheckpointChain::load(dir.path(), "vm1").is_err());
    Ok(())
}

#[test]
fn level_semantics() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let mut chain = CheckpointChain::load(dir.path(), "vm1")?;

    // inc and diff need an existing chain
    for level in [Level::Inc, Level::Diff] {
        let err = chain.checkpoint_for(level).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::NoCheckpoints)
        ));
    }

    // full starts a chain at index 0
    let spec = chain.checkpoint_for(Level::Full)?;
    assert_eq!(spec.name, "virtsparse.0");
    assert_eq!(spec.parent, None);
    assert!(spec.create && spec.append);
    chain.append(spec.name)?;

    // copy has no checkpoint semantics at all
    let spec = chain.checkpoint_for(Level::Copy)?;
    assert!(spec.name.is_empty());
    assert!(!spec.create && !spec.append);

    // inc extends the chain, parented on the last entry
    let spec = chain.checkpoint_for(Level::Inc)?;
    assert_eq!(spec.name, "virtsparse.1");
    assert_eq!(spec.parent.as_deref(), Some("virtsparse.0"));
    assert!(spec.create && spec.append);
    chain.append(spec.name)?;

    // diff queries against the last checkpoint without creating or
    // extending anything
    let spec = chain.checkpoint_for(Level::Diff)?;
    assert!(spec.name.is_empty());
    assert_eq!(spec.parent.as_deref(), Some("virtsparse.1"));
    assert!(!spec.create && !spec.append);

    // a new full wipes and restarts at index 0
    chain.clear()?;
    let spec = chain.checkpoint_for(Level::Full)?;
    assert_eq!(spec.name, "virtsparse.0");
    Ok(())
}

/// Host checkpoints of other tools block the chain.
#[test]
fn foreign_checkpoints_are_rejected() {
    let host = vec![
        "virtsparse.0".to_string(),
        "virtsparse.1".to_string(),
        "someoneElse".to_string(),
    ];
    let err = CheckpointChain::validate_foreign(&host).unwrap_err();
    assert!(matches!(err, JobError::ForeignCheckpoint(name) if name == "someoneElse"));

    let own = vec!["virtsparse.0".to_string(), "virtsparse.1".to_string()];
    assert!(CheckpointChain::validate_foreign(&own).is_ok());
}
