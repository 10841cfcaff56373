//! Image info and port listing command implementations.

use {
    super::load_image,
    anyhow::Result,
    console::style,
    picoptic::{
        DetectedPort, MemoryImage, auto_detect_port, discover_ports, protocol::optic::is_protected,
    },
    std::path::Path,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        let output = ports_json(&detected)?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports:")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let bridge = if port.is_known_bridge() {
            format!(" [{}]", style(port.kind.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{bridge}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

fn ports_json(detected: &[DetectedPort]) -> serde_json::Result<serde_json::Value> {
    Ok(serde_json::json!({
        "ok": true,
        "data": {
            "ports": serde_json::to_value(detected)?,
        }
    }))
}

/// Info command implementation.
pub(crate) fn cmd_info(path: &Path, ignore_out_of_range: bool, json: bool) -> Result<()> {
    let image = load_image(path, ignore_out_of_range)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info_json(path, &image))?);
        return Ok(());
    }

    let pages: Vec<u8> = image
        .programmed_pages()
        .collect();
    let protected: Vec<u8> = pages
        .iter()
        .copied()
        .filter(|&p| is_protected(p))
        .collect();

    println!("{}", style(path.display()).bold());
    println!("  Programmed words: {}", image.programmed_words());
    println!("  Pages:            {}", format_pages(&pages));
    if !protected.is_empty() {
        println!(
            "  {} data in protected pages {} (flash needs -p)",
            style("⚠").yellow(),
            format_pages(&protected)
        );
    }
    println!();
    print!("{}", image.page_map());

    Ok(())
}

fn info_json(path: &Path, image: &MemoryImage) -> serde_json::Value {
    let pages: Vec<u8> = image
        .programmed_pages()
        .collect();
    let protected: Vec<u8> = pages
        .iter()
        .copied()
        .filter(|&p| is_protected(p))
        .collect();
    let map: Vec<String> = image
        .page_map()
        .lines()
        .map(str::to_string)
        .collect();

    serde_json::json!({
        "ok": true,
        "data": {
            "file": path.display().to_string(),
            "programmed_words": image.programmed_words(),
            "pages": pages,
            "protected_pages": protected,
            "map": map,
        }
    })
}

/// Comma separated page list, or "none".
fn format_pages(pages: &[u8]) -> String {
    if pages.is_empty() {
        return "none".to_string();
    }
    pages
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
