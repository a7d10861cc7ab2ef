//! libvirt domain XML rendering.
//!
//! Renders the definition submitted by [`Server::save`](crate::Server::save)
//! unless the caller supplied raw XML. Every interpolated value is escaped.

use quick_xml::escape::escape;

use crate::server::Server;
use crate::types::*;

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    server: &'a Server,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(server: &'a Server) -> Self {
        Self { server }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let s = self.server;
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='{}'>
  <name>{}</name>
  <memory unit='KiB'>{}</memory>
  <currentMemory unit='KiB'>{}</currentMemory>
  <vcpu>{}</vcpu>
"#,
            escape(&s.domain_type),
            escape(&s.name),
            s.max_memory_size.max(s.memory_size),
            s.memory_size,
            s.cpus
        ));

        if s.hugepages {
            xml.push_str("  <memoryBacking>\n    <hugepages/>\n  </memoryBacking>\n");
        }

        xml.push_str(&self.build_os_section());
        xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n    <pae/>\n  </features>\n");
        xml.push_str(&self.build_cpu_section());
        xml.push_str("  <clock offset='utc'/>\n");

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_disks());
        xml.push_str(&self.build_cdrom());
        xml.push_str(&self.build_nics());
        xml.push_str(
            r#"    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <input type='tablet' bus='usb'/>
"#,
        );
        xml.push_str(&graphics_xml(&s.display, "    "));
        xml.push_str("    <video>\n      <model type='cirrus' vram='9216' heads='1'/>\n    </video>\n");
        xml.push_str(&self.build_channels());
        xml.push_str(&self.build_rng());
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");
        xml
    }

    fn build_os_section(&self) -> String {
        let s = self.server;
        let boot_devs: String = s
            .boot_order
            .iter()
            .map(|d| format!("    <boot dev='{}'/>\n", d.as_str()))
            .collect();

        format!(
            "  <os>\n    <type arch='{}'>{}</type>\n{}  </os>\n",
            escape(&s.arch),
            escape(&s.os_type),
            boot_devs
        )
    }

    fn build_cpu_section(&self) -> String {
        let cpu = &self.server.cpu;
        if cpu.is_empty() {
            return String::new();
        }

        let mode = cpu.get("mode").map(String::as_str).unwrap_or("custom");
        match cpu.get("model") {
            Some(model) => format!(
                "  <cpu mode='{}'>\n    <model fallback='allow'>{}</model>\n  </cpu>\n",
                escape(mode),
                escape(model)
            ),
            None => format!("  <cpu mode='{}'/>\n", escape(mode)),
        }
    }

    fn build_disks(&self) -> String {
        let mut xml = String::new();

        for (i, volume) in self.server.volumes.iter().flatten().enumerate() {
            let Some(path) = &volume.path else { continue };
            let format = volume.format_type.as_deref().unwrap_or("raw");

            xml.push_str(&format!(
                r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='{}'/>
      <source file='{}'/>
      <target dev='vd{}' bus='virtio'/>
    </disk>
"#,
                escape(format),
                escape(path),
                disk_letter(i)
            ));
        }

        xml
    }

    fn build_cdrom(&self) -> String {
        let s = self.server;
        let Some(iso_file) = &s.iso_file else {
            return String::new();
        };

        format!(
            r#"    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}/{}'/>
      <target dev='hdc' bus='ide'/>
      <readonly/>
    </disk>
"#,
            escape(s.iso_dir.trim_end_matches('/')),
            escape(iso_file)
        )
    }

    fn build_nics(&self) -> String {
        let mut xml = String::new();

        for nic in &self.server.nics {
            let mac = nic
                .mac
                .as_ref()
                .map(|m| format!("      <mac address='{}'/>\n", escape(m)))
                .unwrap_or_default();

            let source = match nic.nic_type {
                NicType::Bridge => format!(
                    "      <source bridge='{}'/>\n",
                    escape(nic.bridge.as_deref().unwrap_or("br0"))
                ),
                NicType::Network => format!(
                    "      <source network='{}'/>\n",
                    escape(nic.network.as_deref().unwrap_or("default"))
                ),
            };

            xml.push_str(&format!(
                "    <interface type='{}'>\n{}{}      <model type='{}'/>\n    </interface>\n",
                nic.nic_type.as_str(),
                mac,
                source,
                escape(&nic.model)
            ));
        }

        xml
    }

    fn build_channels(&self) -> String {
        if !self.server.guest_agent {
            return String::new();
        }

        r#"    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
"#
        .to_string()
    }

    fn build_rng(&self) -> String {
        let rng = &self.server.virtio_rng;
        if rng.is_empty() {
            return String::new();
        }

        let model = rng.get("backend_model").map(String::as_str).unwrap_or("random");
        let path = rng
            .get("backend_path")
            .map(String::as_str)
            .unwrap_or("/dev/random");

        format!(
            "    <rng model='virtio'>\n      <backend model='{}'>{}</backend>\n    </rng>\n",
            escape(model),
            escape(path)
        )
    }
}

/// `<graphics>` element for a display, each line prefixed with `indent`.
///
/// Also used on its own to update the graphics device of a running domain.
pub fn graphics_xml(display: &Display, indent: &str) -> String {
    let autoport = if display.port == "-1" { "yes" } else { "no" };
    let passwd = if display.password.is_empty() {
        String::new()
    } else {
        format!(" passwd='{}'", escape(&display.password))
    };

    format!(
        "{indent}<graphics type='{}' port='{}' autoport='{}' listen='{}'{}>\n{indent}  <listen type='address' address='{}'/>\n{indent}</graphics>\n",
        escape(&display.display_type),
        escape(&display.port),
        autoport,
        escape(&display.listen),
        passwd,
        escape(&display.listen),
        indent = indent
    )
}

/// Storage volume definition for `options`, falling back to
/// `default_capacity`. Without a capacity (clones) the source's is kept.
pub fn volume_xml(options: &VolumeOptions, default_capacity: Option<&str>) -> String {
    let mut xml = format!("<volume>\n  <name>{}</name>\n", escape(&options.name));

    if let Some(capacity) = options.capacity.as_deref().or(default_capacity) {
        xml.push_str(&size_xml("capacity", capacity));
    }
    if let Some(allocation) = &options.allocation {
        xml.push_str(&size_xml("allocation", allocation));
    }
    if let Some(format) = &options.format_type {
        xml.push_str(&format!(
            "  <target>\n    <format type='{}'/>\n  </target>\n",
            escape(format)
        ));
    }

    xml.push_str("</volume>\n");
    xml
}

/// `10G` -> `<capacity unit='G'>10</capacity>`; a bare number is bytes.
fn size_xml(tag: &str, size: &str) -> String {
    let size = size.trim();
    let split = size.find(|c: char| !c.is_ascii_digit()).unwrap_or(size.len());
    let (amount, unit) = size.split_at(split);
    let unit = if unit.is_empty() { "bytes" } else { unit.trim() };

    format!("  <{tag} unit='{}'>{}</{tag}>\n", escape(unit), escape(amount), tag = tag)
}

// =============================================================================
// READING DEFINITIONS BACK
// =============================================================================

// Minimal scanning, enough for definitions rendered by this crate and by libvirt.

pub(crate) fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let start = xml.find(&open)?;
    let body_start = start + xml[start..].find('>')? + 1;
    let end = body_start + xml[body_start..].find(&format!("</{}>", tag))?;
    Some(xml[body_start..end].trim().to_string())
}

fn attr(element: &str, name: &str) -> Option<String> {
    let key = format!("{}='", name);
    let start = element.find(&key)? + key.len();
    let end = start + element[start..].find('\'')?;
    Some(element[start..end].to_string())
}

fn blocks<'a>(xml: &'a str, open: &str, close: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(open) {
        let Some(len) = rest[start..].find(close) else { break };
        found.push(&rest[start..start + len]);
        rest = &rest[start + len..];
    }
    found
}

pub(crate) fn parse_interfaces(xml: &str) -> Vec<Nic> {
    blocks(xml, "<interface ", "</interface>")
        .into_iter()
        .map(|block| {
            let nic_type = attr(block, "type")
                .and_then(|t| t.parse().ok())
                .unwrap_or_default();
            let source = blocks(block, "<source ", "/>").into_iter().next().unwrap_or_default();
            let mac = blocks(block, "<mac ", "/>").into_iter().next().unwrap_or_default();
            let model = blocks(block, "<model ", "/>").into_iter().next().unwrap_or_default();
            Nic {
                nic_type,
                network: attr(source, "network"),
                bridge: attr(source, "bridge"),
                model: attr(model, "type").unwrap_or_else(|| "virtio".to_string()),
                mac: attr(mac, "address"),
            }
        })
        .collect()
}

pub(crate) fn parse_disk_sources(xml: &str) -> Vec<String> {
    blocks(xml, "<disk ", "</disk>")
        .into_iter()
        .filter(|block| attr(block, "device").as_deref() == Some("disk"))
        .filter_map(|block| {
            let source = blocks(block, "<source ", "/>").into_iter().next()?;
            attr(source, "file")
        })
        .collect()
}

pub(crate) fn parse_graphics(xml: &str) -> Option<Display> {
    let element = blocks(xml, "<graphics ", ">").into_iter().next()?;
    let defaults = Display::default();
    Some(Display {
        port: attr(element, "port").unwrap_or(defaults.port),
        listen: attr(element, "listen").unwrap_or(defaults.listen),
        display_type: attr(element, "type").unwrap_or(defaults.display_type),
        password: attr(element, "passwd").unwrap_or_default(),
    })
}

/// `a`, `b`, ... `z`, `aa`, `ab`, ...
fn disk_letter(index: usize) -> String {
    let mut n = index;
    let mut letters = Vec::new();
    loop {
        letters.push((b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.iter().rev().collect()
}
