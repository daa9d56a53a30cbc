//! gdb command file loaded by a launched debugger

use crate::magic::{MAGIC_COMMAND_ADDR, MAGIC_WHEN_ADDR};

/// Commands that expose checkpoints and event queries inside gdb
///
/// `checkpoint` and `delete-checkpoint` write to the magic command address,
/// `when` reads the magic event address, and `restart N` re-runs the
/// inferior from checkpoint N.
pub fn gdb_init_script() -> String {
    format!(
        r#"define checkpoint
  init-if-undefined $_next_checkpoint_index = 1
  p (*(int*){cmd} = 0x01000000 | $_next_checkpoint_index), $_next_checkpoint_index++
end
document checkpoint
create a checkpoint at the current point of the replay
end
define delete-checkpoint
  p (*(int*){cmd} = 0x02000000 | $arg0), $arg0
end
document delete-checkpoint
remove a checkpoint created by the checkpoint command
end
define restart
  run c$arg0
end
document restart
restart the replay at the given checkpoint
end
define when
  p *(long long int*){when}
end
document when
print the number of the current event
end
define when-tid
  monitor when-tid
end
document when-tid
print the tid of the current task
end
define info-checkpoints
  monitor info checkpoints
end
document info-checkpoints
list the live checkpoints
end
set unwindonsignal on
set prompt (replay)
handle SIGURG stop
"#,
        cmd = MAGIC_COMMAND_ADDR,
        when = MAGIC_WHEN_ADDR,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_uses_magic_addresses() {
        let script = gdb_init_script();
        assert!(script.contains("*(int*)29298 = 0x01000000"));
        assert!(script.contains("*(int*)29298 = 0x02000000"));
        assert!(script.contains("*(long long int*)29302"));
        assert!(script.contains("run c$arg0"));
    }
}
