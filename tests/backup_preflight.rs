use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use virtsparse::backup::{self, BackupOptions};
use virtsparse::checkpoint::CheckpointSpec;
use virtsparse::host::{DiskEndpoint, DiskInfo, HostControl};
use virtsparse::{JobError, Level, StreamType};

/// Host double: one qcow2 disk, scripted checkpoint list, refuses to
/// actually start a job.
struct MockHost {
    checkpoints: Vec<String>,
}

impl HostControl for MockHost {
    fn domain(&self) -> &str {
        "vm1"
    }

    fn disks(&mut self) -> Result<Vec<DiskInfo>, Error> {
        Ok(vec![DiskInfo {
            target: "vda".to_string(),
            format: "qcow2".to_string(),
            path: PathBuf::from("/var/lib/libvirt/images/vm1.qcow2"),
        }])
    }

    fn dump_config(&mut self) -> Result<String, Error> {
        Ok("<domain/>".to_string())
    }

    fn list_checkpoints(&mut self) -> Result<Vec<String>, Error> {
        Ok(self.checkpoints.clone())
    }

    fn delete_checkpoint(&mut self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn checkpoint_xml(&mut self, _name: &str) -> Result<String, Error> {
        Ok("<domaincheckpoint/>".to_string())
    }

    fn redefine_checkpoint(&mut self, _name: &str, _xml: &str) -> Result<(), Error> {
        Ok(())
    }

    fn begin_backup(
        &mut self,
        _disks: &[DiskInfo],
        _socket: &Path,
        _spec: &CheckpointSpec,
        _level: Level,
    ) -> Result<Vec<DiskEndpoint>, Error> {
        bail!("test host cannot start backup jobs");
    }

    fn stop_backup(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

fn options(output: &Path, level: Level) -> BackupOptions {
    BackupOptions {
        domain: "vm1".to_string(),
        output: output.to_path_buf(),
        level,
        stream_type: StreamType::Stream,
        include: Vec::new(),
        exclude: Vec::new(),
        compress: false,
        worker: None,
        backup_raw_disks: false,
        socketfile: output.join("backup.sock"),
        scratchdir: output.to_path_buf(),
        strict: false,
        start_only: false,
        kill_only: false,
        print_only: false,
    }
}

/// An interrupted backup leaves a `.partial` file; the next inc or
/// diff run must refuse, a full may proceed.
#[test]
fn partial_leftovers_block_incrementals() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("vm1.cpt"),
        serde_json::to_vec(&["virtsparse.0"])?,
    )?;
    std::fs::write(dir.path().join("vda.inc.virtsparse.1.data.partial"), b"")?;

    let mut host = MockHost {
        checkpoints: vec!["virtsparse.0".to_string()],
    };

    for level in [Level::Inc, Level::Diff] {
        let err = backup::run(&mut host, &options(dir.path(), level)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::PartialBackupPresent(_))
        ));
    }

    // a full wipes the chain and proceeds past preflight, stopping
    // only at the job start (which the double refuses)
    let err = backup::run(&mut host, &options(dir.path(), Level::Full)).unwrap_err();
    assert!(err.to_string().contains("unable to start backup job"));

    Ok(())
}

#[test]
fn incrementals_need_a_chain() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let mut host = MockHost {
        checkpoints: Vec::new(),
    };

    let err = backup::run(&mut host, &options(dir.path(), Level::Inc)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<JobError>(),
        Some(JobError::NoCheckpoints)
    ));
    Ok(())
}

/// Foreign checkpoints block full and inc, copy does not care.
#[test]
fn foreign_checkpoints_block_chain_levels() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("vm1.cpt"),
        serde_json::to_vec(&["virtsparse.0"])?,
    )?;

    let mut host = MockHost {
        checkpoints: vec!["virtsparse.0".to_string(), "someoneElse".to_string()],
    };

    for level in [Level::Full, Level::Inc] {
        let err = backup::run(&mut host, &options(dir.path(), level)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::ForeignCheckpoint(_))
        ));
    }

    // copy has no checkpoint semantics, it proceeds to the job start
    let err = backup::run(&mut host, &options(dir.path(), Level::Copy)).unwrap_err();
    assert!(err.to_string().contains("unable to start backup job"));
    Ok(())
}

/// Raw output cannot express deltas.
#[test]
fn raw_output_refused_for_incrementals() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("vm1.cpt"),
        serde_json::to_vec(&["virtsparse.0"])?,
    )?;
    let mut host = MockHost {
        checkpoints: vec!["virtsparse.0".to_string()],
    };

    let mut opts = options(dir.path(), Level::Inc);
    opts.stream_type = StreamType::Raw;
    let err = backup::run(&mut host, &opts).unwrap_err();
    assert!(err.to_string().contains("not supported"));
    Ok(())
}
