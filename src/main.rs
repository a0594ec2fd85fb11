fn main() {
    kvstress::cmdline();
}
