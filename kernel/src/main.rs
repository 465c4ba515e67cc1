// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// The kernel's entry point. The boot shim switches the CPU
// into long mode, maps the kernel higher-half, and calls
// kmain with the multiboot2 magic value and the physical
// address of the boot information block.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_main {
    use core::panic::PanicInfo;
    use interrupts::Guard;
    use log::info;
    use memlayout::{PhysAddr, VirtAddr};
    use pretty::Bytes;
    use serial::println;
    use time::Duration;
    use virtmem::PageFlags;

    /// This function is called on panic: report, trace, halt.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        x86_64::instructions::interrupts::disable();
        println!("kernel panic: {}", info);
        kernel::trace::print_stack_trace();
        kernel::halt_loop();
    }

    #[no_mangle]
    pub extern "C" fn kmain(magic: u32, info_addr: usize) -> ! {
        let boot_info = kernel::init(magic, PhysAddr::new(info_addr));

        if let Some(framebuffer) = boot_info.framebuffer() {
            info!(
                "Framebuffer: {}x{} at {} bpp, {:?}.",
                framebuffer.width, framebuffer.height, framebuffer.bpp, framebuffer.addr
            );
        }

        info!("Kernel ready!");
        physmem::debug();

        thread::create_thread(initial_workload);

        // Become the idle loop; from here on the scheduler
        // owns the flow of execution.
        thread::start();
    }

    /// A page in an otherwise unused part of the higher half,
    /// used to smoke-test the mapping path at boot.
    const SCRATCH_PAGE: VirtAddr = VirtAddr::new(0xffff_a000_0000_0000);

    /// The first real thread. It smoke-tests the memory
    /// managers, exercises the clock and the sleep queue, then
    /// exits back into the idle loop.
    fn initial_workload() {
        info!("Initial workload running.");
        info!(
            "Kernel heap: {} reserved.",
            Bytes::from_usize(heap::KERNEL_HEAP_SIZE)
        );

        map_smoke_test();

        thread::sleep_for(Duration::from_millis(50));
        info!("Awake after 50 ms; uptime {} ms.", time::now_ns() / 1_000_000);
    }

    /// Maps a fresh frame, writes through the new page, checks
    /// the translation, and unmaps it again.
    fn map_smoke_test() {
        let frame = {
            let _guard = Guard::new();
            physmem::allocate_frame().expect("no frame for mapping test")
        };

        {
            let _guard = Guard::new();
            unsafe { virtmem::map(frame, SCRATCH_PAGE, PageFlags::WRITABLE | PageFlags::NO_EXECUTE) }
                .expect("scratch page mapping failed")
                .flush();
        }

        let scratch = SCRATCH_PAGE.as_mut_ptr::<u64>();
        unsafe {
            scratch.write_volatile(0x6c616e7465726e);
            assert_eq!(scratch.read_volatile(), 0x6c616e7465726e);
        }
        assert_eq!(virtmem::translate(SCRATCH_PAGE), Some(frame));

        {
            let _guard = Guard::new();
            unsafe { virtmem::unmap(SCRATCH_PAGE, true) };
            unsafe { physmem::deallocate_frame(frame) };
        }
        assert_eq!(virtmem::translate(SCRATCH_PAGE), None);

        info!("Page mapping smoke test passed.");
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
