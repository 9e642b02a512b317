//! Process system calls: fork, waitpid, exit, getpid, execv.

use std::sync::Arc;

use crate::config::{ARG_MAX, PATH_MAX, WORD_SIZE};
use crate::kthread;
use crate::machine::TrapFrame;
use crate::memory::addrspace::AddressSpace;
use crate::memory::coremap::Coremap;
use crate::memory::MemError;
use crate::process::{encode_exit, Pid, Process, WaitOutcome};
use crate::Kernel;

use super::SyscallError;

/// The caller's own PID. Infallible.
pub fn sys_getpid(caller: &Process) -> Pid {
    caller.pid
}

/// Duplicate the caller. The child resumes with the given `child_pc`
/// and a zeroed return register; the parent gets the child's PID.
///
/// The child is registered and its kernel thread started here, but it
/// does not run user code until the final handoff signal: everything
/// the parent copies into it (address space, file table) is in place
/// first. Refused at the process ceiling, with all partial state
/// unwound.
pub fn sys_fork(
    kernel: &Arc<Kernel>,
    caller: &Arc<Process>,
    tf: &TrapFrame,
    child_pc: u64,
) -> Result<Pid, SyscallError> {
    let child_space = {
        let guard = caller.aspace.lock();
        let aspace = guard.as_ref().ok_or(SyscallError::InvalidArgument)?;
        aspace.copy(&kernel.coremap)?
    };

    let child = match kernel
        .proc_table
        .create(&kernel.rand, &caller.name, Some(caller.pid))
    {
        Ok(child) => child,
        Err(e) => {
            child_space.destroy(&kernel.coremap);
            return Err(e.into());
        }
    };
    *child.aspace.lock() = Some(child_space);
    *child.files.lock() = caller.files.lock().as_ref().map(|f| f.copy());

    let mut child_tf = tf.clone();
    child_tf.pc = child_pc;
    child_tf.ret = 0;
    kthread::spawn(Arc::clone(kernel), Arc::clone(&child), child_tf);

    // Setup is complete; release the child into user mode.
    child.forksem.signal();
    log::debug!("[SYS] {} forked {}", caller.pid, child.pid);
    Ok(child.pid)
}

/// Reap one child: block until `target` exits, then collect its
/// encoded status and destroy it. Only the first waiter to claim a
/// target is honored.
pub fn sys_waitpid(
    kernel: &Arc<Kernel>,
    caller: &Arc<Process>,
    target: Pid,
    options: i32,
) -> Result<(i32, Pid), SyscallError> {
    if options != 0 {
        return Err(SyscallError::InvalidArgument);
    }
    if target == caller.pid {
        return Err(SyscallError::InvalidArgument);
    }
    if !target.in_user_range() {
        return Err(SyscallError::NoSuchProcess);
    }

    // The claim happens under the table lock; the block does not.
    match kernel.proc_table.begin_wait(caller.pid, target)? {
        WaitOutcome::Ready(_) => {}
        WaitOutcome::Block(proc) => proc.exitsem.wait(),
    }

    let (status, proc) = kernel.proc_table.reap(target);
    kernel.release_resources(&proc);
    Ok((status, target))
}

/// Record a voluntary exit. The caller's thread must already be
/// detached; it stops running user code after this returns.
pub fn sys_exit(kernel: &Kernel, caller: &Arc<Process>, code: i32) {
    exit_with_status(kernel, caller, encode_exit(code));
}

/// Common exit path for voluntary exits and fault terminations.
///
/// The status is recorded in the table before the exit notification is
/// signaled, so a waiter never observes a missing status. A parentless
/// process destroys itself; an exiting parent reaps its zombie
/// children and detaches the running ones.
pub fn exit_with_status(kernel: &Kernel, caller: &Arc<Process>, status: i32) {
    let actions = kernel.proc_table.note_exit(caller.pid, status);
    for zombie in actions.orphan_zombies {
        kernel.release_resources(&zombie);
    }
    if let Some(me) = actions.self_destroy {
        kernel.release_resources(&me);
    }
    caller.exitsem.signal();
}

/// Replace the caller's image with a freshly loaded program.
///
/// Returns the register state for entering the new image; the old
/// address space is destroyed only once the new one is fully built, so
/// any failure leaves the caller runnable with its old image.
pub fn sys_execv(
    kernel: &Arc<Kernel>,
    caller: &Arc<Process>,
    path: &str,
    args: &[&str],
) -> Result<TrapFrame, SyscallError> {
    if path.is_empty() {
        return Err(SyscallError::NoSuchFile);
    }
    if path.len() > PATH_MAX {
        return Err(SyscallError::ArgListTooLong);
    }
    if arg_block_size(args) > ARG_MAX {
        return Err(SyscallError::ArgListTooLong);
    }

    let mut new_space = AddressSpace::new();
    let built = (|| {
        let entry = kernel
            .loader
            .load(path, &mut new_space, &kernel.coremap)?;
        let sp_top = new_space.define_stack();
        let (sp, argc, argv) =
            write_arg_image(&mut new_space, &kernel.coremap, sp_top, args)?;
        Ok::<_, SyscallError>(TrapFrame {
            pc: entry,
            sp,
            ret: 0,
            arg0: argc,
            arg1: argv,
        })
    })();

    match built {
        Ok(tf) => {
            let old = caller.aspace.lock().replace(new_space);
            if let Some(old) = old {
                old.destroy(&kernel.coremap);
            }
            kernel.tlb.flush_pid(caller.pid);
            log::debug!("[EXEC] {} now running '{}'", caller.pid, path);
            Ok(tf)
        }
        Err(e) => {
            new_space.destroy(&kernel.coremap);
            Err(e)
        }
    }
}

/// Bytes the argument block will occupy on the user stack: each string
/// with its NUL, padded to word alignment, plus the null-terminated
/// pointer array.
fn arg_block_size(args: &[&str]) -> usize {
    let word = WORD_SIZE as usize;
    let strings: usize = args
        .iter()
        .map(|a| (a.len() + 1).next_multiple_of(word))
        .sum();
    strings + (args.len() + 1) * word
}

/// Build the initial stack image: argument strings pushed in reverse
/// order, each start word-aligned, then the null-terminated argv
/// pointer array below them. Returns the stack pointer (the address of
/// `argv[0]`), the argument count, and the argv pointer.
pub(crate) fn write_arg_image(
    aspace: &mut AddressSpace,
    coremap: &Coremap,
    sp_top: u64,
    args: &[&str],
) -> Result<(u64, u64, u64), MemError> {
    let mut sp = sp_top;
    let mut ptrs: Vec<u64> = Vec::with_capacity(args.len() + 1);
    for arg in args.iter().rev() {
        sp -= arg.len() as u64 + 1;
        sp &= !(WORD_SIZE - 1);
        aspace.write_bytes(coremap, sp, arg.as_bytes())?;
        aspace.write_bytes(coremap, sp + arg.len() as u64, &[0])?;
        ptrs.push(sp);
    }
    ptrs.reverse();
    ptrs.push(0);

    sp -= ptrs.len() as u64 * WORD_SIZE;
    for (i, ptr) in ptrs.iter().enumerate().rev() {
        let word = (*ptr as u32).to_le_bytes();
        aspace.write_bytes(coremap, sp + i as u64 * WORD_SIZE, &word)?;
    }
    Ok((sp, args.len() as u64, sp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_SIZE, USERSPACE_TOP};
    use crate::memory::addrspace::RegionPerms;

    fn stacked_space() -> (AddressSpace, Coremap) {
        let mut aspace = AddressSpace::new();
        aspace
            .define_region(0x40_0000, PAGE_SIZE, RegionPerms::READ)
            .unwrap();
        aspace.prepare_load();
        aspace.define_stack();
        (aspace, Coremap::with_frames(64))
    }

    fn read_word(aspace: &mut AddressSpace, cm: &Coremap, vaddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        aspace.read_bytes(cm, vaddr, &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    fn read_cstr(aspace: &mut AddressSpace, cm: &Coremap, mut vaddr: u64) -> String {
        let mut out = Vec::new();
        loop {
            let mut byte = [0u8];
            aspace.read_bytes(cm, vaddr, &mut byte).unwrap();
            if byte[0] == 0 {
                return String::from_utf8(out).unwrap();
            }
            out.push(byte[0]);
            vaddr += 1;
        }
    }

    #[test]
    fn test_arg_image_layout() {
        let (mut aspace, cm) = stacked_space();
        let args = ["prog", "alpha", "beta-long-argument"];
        let (sp, argc, argv) =
            write_arg_image(&mut aspace, &cm, USERSPACE_TOP, &args).unwrap();

        assert_eq!(argc, 3);
        assert_eq!(sp, argv);
        assert_eq!(sp % WORD_SIZE, 0);

        // Pointer array: argc entries then a null terminator, each
        // string word-aligned and above the array.
        for (i, expect) in args.iter().enumerate() {
            let ptr = read_word(&mut aspace, &cm, argv + i as u64 * WORD_SIZE) as u64;
            assert!(ptr > argv && ptr < USERSPACE_TOP);
            assert_eq!(ptr % WORD_SIZE, 0);
            assert_eq!(read_cstr(&mut aspace, &cm, ptr), *expect);
        }
        assert_eq!(
            read_word(&mut aspace, &cm, argv + 3 * WORD_SIZE),
            0
        );
        aspace.destroy(&cm);
    }

    #[test]
    fn test_arg_image_empty_args() {
        let (mut aspace, cm) = stacked_space();
        let (sp, argc, argv) =
            write_arg_image(&mut aspace, &cm, USERSPACE_TOP, &[]).unwrap();
        assert_eq!(argc, 0);
        assert_eq!(read_word(&mut aspace, &cm, argv), 0);
        assert_eq!(sp, USERSPACE_TOP - WORD_SIZE);
        aspace.destroy(&cm);
    }

    #[test]
    fn test_arg_block_size_counts_padding_and_pointers() {
        // "ab" -> 3 bytes padded to 4; pointer array 2 words.
        assert_eq!(arg_block_size(&["ab"]), 4 + 8);
        assert_eq!(arg_block_size(&[]), 4);
    }
}
