use crate::{CAPABILITIES, ProvisionError};
use std::{io, mem, ptr};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 64 * 1024 {
        libc::SIGSTKSZ
    } else {
        64 * 1024
    }
}

/// The size of the alternate stack the signal handler runs on.
///
/// This has a minimum size of 64k, which is far more than the handler itself
/// needs, but leaves room for a [`crate::ReportAppender`] that walks the stack.
/// The memory is only committed if we actually get a signal.
pub(crate) const SIG_STACK_SIZE: usize = get_stack_size();

/// An alternate signal stack registered for the thread that enabled the
/// handler
pub(super) struct AlternateStack {
    base: *mut libc::c_void,
    size: usize,
    /// The mapping, including the guard page, if we allocated the stack
    /// ourselves rather than reusing one that was already registered
    mapping: Option<(*mut libc::c_void, usize)>,
    /// The alternate stack that was registered before ours, if any
    previous: Option<libc::stack_t>,
    registered: bool,
}

unsafe impl Send for AlternateStack {}

impl AlternateStack {
    #[inline]
    pub(super) fn base(&self) -> *mut libc::c_void {
        self.base
    }

    #[inline]
    pub(super) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(super) fn is_registered(&self) -> bool {
        self.registered
    }

    /// Unregisters and unmaps the stack.
    ///
    /// This is only possible on the thread the stack was registered on, if the
    /// stack is not the one currently registered for the calling thread,
    /// nothing is done and `false` is returned. Must only be called once no
    /// signal handler can run on the stack any longer.
    pub(super) unsafe fn release(&mut self) -> bool {
        let Some((mapping, mapping_size)) = self.mapping else {
            // Not ours, someone else is responsible for it
            self.registered = false;
            return true;
        };

        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) == -1 || current.ss_sp != self.base {
                return false;
            }

            if let Some(previous) = &self.previous {
                // Restore the old alt stack if there was one
                if libc::sigaltstack(previous, ptr::null_mut()) == -1 {
                    return false;
                }
            } else {
                // Restore to the default alt stack otherwise
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                if libc::sigaltstack(&disable, ptr::null_mut()) == -1 {
                    return false;
                }
            }

            let r = libc::munmap(mapping, mapping_size);
            debug_assert_eq!(r, 0, "munmap of alternate stack failed");
        }

        self.mapping = None;
        self.registered = false;
        true
    }
}

/// Registers an alternative stack for the calling thread to run the signal
/// handler on. This is done since the signal might have been caused by a stack
/// overflow.
pub(super) fn provision() -> Result<AlternateStack, ProvisionError> {
    if !CAPABILITIES.alt_stack {
        return Err(ProvisionError::PlatformUnsupported);
    }

    // SAFETY: syscalls
    unsafe {
        // Check to see if the existing sigaltstack, and if it exists, is it big
        // enough. If so we don't need to allocate our own.
        let mut old_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
            return Err(ProvisionError::Register(io::Error::last_os_error()));
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            log::debug!("reusing existing alternate stack of {} bytes", old_stack.ss_size);

            return Ok(AlternateStack {
                base: old_stack.ss_sp,
                size: old_stack.ss_size,
                mapping: None,
                previous: None,
                registered: true,
            });
        }

        // ... but failing that we need to allocate our own, with a guard page
        // at the bottom so that overflowing the alternate stack faults rather
        // than silently corrupting whatever is mapped below it
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let mapping = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if mapping == libc::MAP_FAILED {
            return Err(ProvisionError::OutOfMemory);
        }

        let unmap = |err: io::Error| {
            libc::munmap(mapping, alloc_size);
            ProvisionError::Register(err)
        };

        // Prepare the stack with readable/writable memory and then register it
        // with `sigaltstack`.
        let stack_ptr = mapping.cast::<u8>().add(guard_size).cast::<libc::c_void>();
        if libc::mprotect(stack_ptr, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) == -1 {
            return Err(unmap(io::Error::last_os_error()));
        }

        let mut new_stack: libc::stack_t = mem::zeroed();
        new_stack.ss_sp = stack_ptr;
        new_stack.ss_flags = 0;
        new_stack.ss_size = SIG_STACK_SIZE;

        if libc::sigaltstack(&new_stack, ptr::null_mut()) == -1 {
            return Err(unmap(io::Error::last_os_error()));
        }

        log::debug!("registered alternate stack of {SIG_STACK_SIZE} bytes");

        Ok(AlternateStack {
            base: stack_ptr,
            size: SIG_STACK_SIZE,
            mapping: Some((mapping, alloc_size)),
            previous: (old_stack.ss_flags & libc::SS_DISABLE == 0).then_some(old_stack),
            registered: true,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn current() -> libc::stack_t {
        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut current), 0);
            current
        }
    }

    #[test]
    fn provisions_and_releases() {
        // Run on a fresh thread so we don't disturb the alternate stack of the
        // test harness threads
        std::thread::spawn(|| {
            let before = current();

            let mut stack = provision().expect("failed to provision alternate stack");
            assert!(stack.is_registered());
            assert!(stack.size() >= SIG_STACK_SIZE);

            let registered = current();
            assert_eq!(registered.ss_sp, stack.base());
            assert_eq!(registered.ss_flags & libc::SS_DISABLE, 0);

            // A second provision reuses the stack we just registered
            let mut reused = provision().expect("failed to provision alternate stack");
            assert_eq!(reused.base(), stack.base());
            assert!(unsafe { reused.release() });
            assert_eq!(current().ss_sp, stack.base());

            assert!(unsafe { stack.release() });
            assert!(!stack.is_registered());

            let after = current();
            assert_eq!(after.ss_flags & libc::SS_DISABLE, before.ss_flags & libc::SS_DISABLE);
            if before.ss_flags & libc::SS_DISABLE == 0 {
                assert_eq!(after.ss_sp, before.ss_sp);
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn release_only_on_owning_thread() {
        let mut stack = std::thread::spawn(|| {
            let stack = provision().expect("failed to provision alternate stack");
            assert!(stack.mapping.is_some());
            stack
        })
        .join()
        .unwrap();

        // The owning thread has exited, but its stack is not the one registered
        // on this thread, so it must be left alone
        assert!(!unsafe { stack.release() });
        assert!(stack.is_registered());
    }
}
