fn main() {
    #[cfg(target_os = "windows")]
    {
        let mut res = winres::WindowsResource::new();
        res.set("CompanyName", "DLC Launcher");
        res.set("FileDescription", "Peer-to-peer content launcher and self-updater");
        res.set("ProductName", "DLC Launcher");
        res.set("OriginalFilename", "dlc-launcher.exe");
        res.set("InternalName", "dlc-launcher");

        let version = env!("CARGO_PKG_VERSION");
        let packed = version
            .split('.')
            .take(3)
            .enumerate()
            .fold(0u64, |acc, (idx, part)| {
                let value: u64 = part.parse().unwrap_or(0);
                acc | (value << (48 - 16 * idx as u64))
            });
        res.set_version_info(winres::VersionInfo::PRODUCTVERSION, packed);
        res.set_version_info(winres::VersionInfo::FILEVERSION, packed);

        if let Err(e) = res.compile() {
            eprintln!("cargo:warning=Failed to compile Windows resources: {}", e);
        }
    }
}
