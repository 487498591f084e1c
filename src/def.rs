
// System paths
pub const DEV_MEM_PATH: &'static str = "/dev/mem";
pub const VCIO_DEVICE_PATH: &'static str = "/dev/vcio";
pub const DT_COMPATIBLE_PATH: &'static str = "/proc/device-tree/compatible";
pub const CPUINFO_PATH: &'static str = "/proc/cpuinfo";


// Physical peripheral bases as seen by the ARM core
pub const BCM2835_PERI_BASE: u32 = 0x2000_0000;
pub const BCM2836_PERI_BASE: u32 = 0x3f00_0000;
pub const BCM2711_PERI_BASE: u32 = 0xfe00_0000;

// Peripheral base as seen by the DMA engine
pub const PERI_BUS_BASE: u32 = 0x7e00_0000;

// PLLD frequencies in MHz
pub const BCM2835_PLLD_MHZ: u32 = 500;
pub const BCM2711_PLLD_MHZ: u32 = 750;


// Register window offsets relative to the peripheral base and window sizes
pub const DMA_OFFSET: u32 = 0x0000_7000;
pub const CLK_OFFSET: u32 = 0x0010_1000;
pub const GPIO_OFFSET: u32 = 0x0020_0000;
pub const PCM_OFFSET: u32 = 0x0020_3000;
pub const PWM_OFFSET: u32 = 0x0020_c000;

pub const DMA_LEN: usize = 0x1000;
pub const CLK_LEN: usize = 0xa8;
pub const GPIO_LEN: usize = 0x100;
pub const PCM_LEN: usize = 0x24;
pub const PWM_LEN: usize = 0x28;


// DMA channel register block, byte offsets relative to the channel
pub const DMA_CHAN_SIZE: usize = 0x100;
pub const DMA_CS: usize = 0x00;
pub const DMA_CONBLK_AD: usize = 0x04;
pub const DMA_DEBUG: usize = 0x20;

// DMA CS bits
pub const DMA_CS_ACTIVE: u32 = 1 << 0;
pub const DMA_CS_END: u32 = 1 << 1;
pub const DMA_CS_INT: u32 = 1 << 2;
pub const DMA_CS_RESET: u32 = 1 << 31;
pub const DMA_CS_WAIT_FOR_OUTSTANDING_WRITES: u32 = 1 << 28;
pub const DMA_CS_PANIC_PRIORITY_8: u32 = 8 << 20;
pub const DMA_CS_PRIORITY_8: u32 = 8 << 16;
pub const DMA_DEBUG_CLEAR_ERRORS: u32 = 0x7;

// DMA transfer information bits
pub const DMA_TI_WAIT_RESP: u32 = 1 << 3;
pub const DMA_TI_DEST_DREQ: u32 = 1 << 6;
pub const DMA_TI_NO_WIDE_BURSTS: u32 = 1 << 26;
pub const DMA_TI_PERMAP_SHIFT: u32 = 16;

// DREQ peripheral numbers
pub const DREQ_PCM_TX: u32 = 2;
pub const DREQ_PWM: u32 = 5;

// Control block geometry, in 32-bit words
pub const CB_WORDS: usize = 8;
pub const CB_TI: usize = 0;
pub const CB_SOURCE_AD: usize = 1;
pub const CB_DEST_AD: usize = 2;
pub const CB_TXFR_LEN: usize = 3;
pub const CB_STRIDE: usize = 4;
pub const CB_NEXTCONBK: usize = 5;


// GPIO registers, byte offsets
pub const GPIO_FSEL0: usize = 0x00;
pub const GPIO_SET0: usize = 0x1c;
pub const GPIO_CLR0: usize = 0x28;
pub const GPIO_FSEL_OUTPUT: u32 = 0b001;
pub const GPIO_FSEL_MASK: u32 = 0b111;


// PWM registers, byte offsets
pub const PWM_CTL: usize = 0x00;
pub const PWM_DMAC: usize = 0x08;
pub const PWM_RNG1: usize = 0x10;
pub const PWM_FIFO: usize = 0x18;

pub const PWM_CTL_PWEN1: u32 = 1 << 0;
pub const PWM_CTL_USEF1: u32 = 1 << 5;
pub const PWM_CTL_CLRF: u32 = 1 << 6;
pub const PWM_DMAC_ENAB: u32 = 1 << 31;
pub const PWM_DMAC_THRESHOLDS: u32 = (15 << 8) | 15;


// PCM registers, byte offsets
pub const PCM_CS_A: usize = 0x00;
pub const PCM_FIFO_A: usize = 0x04;
pub const PCM_MODE_A: usize = 0x08;
pub const PCM_TXC_A: usize = 0x10;
pub const PCM_DREQ_A: usize = 0x14;

pub const PCM_CS_EN: u32 = 1 << 0;
pub const PCM_CS_TXON: u32 = 1 << 2;
pub const PCM_CS_TXCLR: u32 = 1 << 3;
pub const PCM_CS_RXCLR: u32 = 1 << 4;
pub const PCM_CS_DMAEN: u32 = 1 << 9;
pub const PCM_TXC_CH1_ENABLE_8BIT: u32 = 1 << 30;
pub const PCM_MODE_FLEN_SHIFT: u32 = 10;
pub const PCM_DREQ_THRESHOLDS: u32 = (64 << 24) | (64 << 8);


// Clock manager registers, byte offsets
pub const CM_PCM_CTL: usize = 0x98;
pub const CM_PCM_DIV: usize = 0x9c;
pub const CM_PWM_CTL: usize = 0xa0;
pub const CM_PWM_DIV: usize = 0xa4;

pub const CM_PASSWORD: u32 = 0x5a00_0000;
pub const CM_SRC_PLLD: u32 = 6;
pub const CM_ENAB: u32 = 1 << 4;
pub const CM_DIVI_SHIFT: u32 = 12;
pub const CM_DIVI_MAX: u32 = 0xfff;


// VideoCore mailbox property interface
pub const MBOX_TAG_MEM_ALLOC: u32 = 0x0003_000c;
pub const MBOX_TAG_MEM_LOCK: u32 = 0x0003_000d;
pub const MBOX_TAG_MEM_UNLOCK: u32 = 0x0003_000e;
pub const MBOX_TAG_MEM_FREE: u32 = 0x0003_000f;
pub const MBOX_REQUEST: u32 = 0;
pub const MBOX_RESPONSE_OK: u32 = 0x8000_0000;
pub const MBOX_IOCTL_MAGIC: u32 = 100;

// VideoCore allocation flags
pub const MEM_FLAG_DIRECT: u32 = 1 << 2;
pub const MEM_FLAG_COHERENT: u32 = 2 << 2;
pub const MEM_FLAG_L1_NONALLOCATING: u32 = MEM_FLAG_DIRECT | MEM_FLAG_COHERENT;

// Bus address alias bits stripped to get a physical address
pub const BUS_ALIAS_MASK: u32 = 0xc000_0000;


// Misc
pub const PAGE_SIZE: usize = 4096;
