//! Provides various ways to make your program sad, each of these functions
//! terminates the process (or at least the thread) one way or another unless a
//! signal handler intervenes.

#![allow(unsafe_code)]

use std::os::unix::io::AsRawFd;

/// The address that [`raise_segfault`] reads from. It's in the first page(s) of
/// the address space, which is never mapped.
pub const SEGFAULT_ADDRESS: usize = 0x40;

/// Raises `SIGSEGV` by reading from [`SEGFAULT_ADDRESS`]
pub fn raise_segfault() {
    let value = unsafe { std::ptr::read_volatile(SEGFAULT_ADDRESS as *const u8) };

    println!("we are crashing by accessing an invalid address: {value}");
}

/// Raises `SIGFPE` by dividing an integer by zero.
///
/// Rust checks for division by zero, so this is done with inline assembly on
/// x86. On other architectures integer division by zero doesn't trap, so the
/// signal is raised explicitly instead.
pub fn raise_floating_point_exception() {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let ohno: u32;
        unsafe {
            std::arch::asm!(
                "mov eax, 1",
                "cdq",
                "mov {div:e}, 0",
                "idiv {div:e}",
                div = out(reg) ohno,
                out("eax") _,
                out("edx") _,
            );
        }

        println!("we are crashing by dividing by zero: {ohno}");
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    raise_signal(libc::SIGFPE);
}

/// Raises `SIGILL` by executing an instruction that is guaranteed to be undefined
pub fn raise_illegal_instruction() {
    unsafe {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        std::arch::asm!("ud2");
        #[cfg(target_arch = "aarch64")]
        std::arch::asm!("udf #0");
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        libc::raise(libc::SIGILL);
    }
}

/// Raises `SIGBUS` by reading from a mapping of an empty file
pub fn raise_bus() {
    let path =
        std::env::temp_dir().join(format!("sadness-generator-bus-{}", std::process::id()));

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .expect("failed to create file to map");

    // The mapping keeps the file alive, so there's no need to leave it lying around
    let _ = std::fs::remove_file(&path);

    unsafe {
        let mapping = libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );

        if mapping == libc::MAP_FAILED {
            libc::raise(libc::SIGBUS);
            return;
        }

        // The file is empty, so there is no backing page for any of the mapping
        let value = std::ptr::read_volatile(mapping.cast::<u8>().add(1));
        println!("we are crashing by reading past the end of a file: {value}");
    }
}

/// Raises `SIGSEGV` by overflowing the stack of the calling thread
pub fn raise_stack_overflow() {
    let mut big_boi = [0u8; 9 * 1024 * 1024];
    big_boi[big_boi.len() - 1] = 1;

    println!("{:?}", &big_boi[big_boi.len() - 20..]);
}

/// Sends the signal to the calling thread, rather than it being generated by a
/// hardware fault
pub fn raise_signal(signal: i32) {
    unsafe {
        libc::raise(signal);
    }
}
